//! End-to-end tests: simulated camera to receiver over loopback UDP.

use bytes::Bytes;
use camlink_delivery::{
    ConsumerLoop, DecodeError, FrameDecoder, FrameQueue, FrameSink, JpegProbe, OverflowPolicy,
    RecordingSink,
};
use camlink_session::{
    CameraEndpoint, DropReason, Session, SessionConfig, SessionEvent, SessionState,
};
use camlink_wire::{Chunker, CompletedFrame, ControlMessage, HeaderLayout};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn receiver_config() -> SessionConfig {
    SessionConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        peer_port: None,
        discovery_timeout: Duration::from_secs(1),
        ack_timeout: Duration::from_secs(1),
        keepalive_interval: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

/// Discover, handshake and start receiving; returns the connected camera
async fn connect(
    config: SessionConfig,
    chunker: Chunker,
    queue: Arc<FrameQueue>,
) -> (
    CameraEndpoint,
    camlink_session::SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    let (tx, events) = mpsc::unbounded_channel();
    let mut session = Session::bind(config).await.unwrap().with_events(tx);
    let session_addr = session.local_addr().unwrap();

    let mut camera = CameraEndpoint::bind("127.0.0.1:0".parse().unwrap(), chunker)
        .await
        .unwrap();
    let camera_task = tokio::spawn(async move {
        camera.announce(session_addr).await.unwrap();
        camera.accept_hello(Duration::from_secs(1)).await.unwrap();
        camera
    });

    session.handshake().await.unwrap();
    let camera = camera_task.await.unwrap();
    let handle = session.start(queue).unwrap();
    (camera, handle, events)
}

fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_abc_frame_over_udp() {
    let queue = Arc::new(FrameQueue::default());
    let (camera, handle, _events) = connect(receiver_config(), Chunker::default(), queue.clone()).await;

    camera.send_raw(&[0x00, 0x03, 0x00, 0x00, b'A']).await.unwrap();
    camera.send_raw(&[0x00, 0x03, 0x00, 0x01, b'B']).await.unwrap();
    camera.send_raw(&[0x00, 0x03, 0x00, 0x02, b'C']).await.unwrap();

    let frame = timeout(Duration::from_secs(1), queue.pop()).await.unwrap().unwrap();
    assert_eq!(&frame.bytes[..], b"ABC");
    assert_eq!(frame.sequence, 1);

    handle.disconnect();
    let stats = handle.join().await;
    assert_eq!(stats.datagrams_received, 3);
    assert_eq!(stats.acks_sent, 3);
    assert_eq!(stats.frames_completed, 1);
}

#[tokio::test]
async fn test_missing_index_records_drop() {
    let queue = Arc::new(FrameQueue::default());
    let (camera, handle, mut events) = connect(receiver_config(), Chunker::default(), queue.clone()).await;

    camera.send_raw(&[0x00, 0x03, 0x00, 0x00, b'A']).await.unwrap();
    camera.send_raw(&[0x00, 0x03, 0x00, 0x02, b'C']).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.stats().datagrams_received, 2);

    handle.disconnect();
    let stats = handle.join().await;

    assert!(queue.pop().await.is_none(), "no frame may reach the queue");
    assert_eq!(stats.frames_completed, 0);
    assert_eq!(stats.frames_dropped, 1);

    let dropped: Vec<DropReason> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::FrameDropped { reason } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![DropReason::Abandoned { received: 2, expected: 3 }]);
}

#[tokio::test]
async fn test_malformed_datagram_is_reported() {
    let queue = Arc::new(FrameQueue::default());
    let (camera, handle, mut events) = connect(receiver_config(), Chunker::default(), queue.clone()).await;

    camera.send_raw(&[0x00, 0x01, 0x00]).await.unwrap();
    camera.send_raw(&[0x00, 0x01, 0x00, 0x00, b'Z']).await.unwrap();

    let frame = timeout(Duration::from_secs(1), queue.pop()).await.unwrap().unwrap();
    assert_eq!(&frame.bytes[..], b"Z");

    handle.disconnect();
    let stats = handle.join().await;
    assert_eq!(stats.malformed_packets, 1);
    // The short datagram was still acknowledged
    assert_eq!(stats.acks_sent, 2);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::MalformedPacket { len: 3, .. })));
}

fn synthetic_jpeg(width: u16, height: u16, filler: usize) -> Bytes {
    let mut jpeg = vec![0xFF, 0xD8];
    jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
    jpeg.extend_from_slice(&height.to_be_bytes());
    jpeg.extend_from_slice(&width.to_be_bytes());
    jpeg.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
    jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
    jpeg.extend((0..filler).map(|i| (i % 251) as u8 & 0x7F));
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    Bytes::from(jpeg)
}

/// Treats the aux byte as a brightness reading
struct AuxBrightness;

impl FrameDecoder for AuxBrightness {
    type Image = u8;

    fn decode(&self, bytes: &[u8]) -> Result<u8, DecodeError> {
        JpegProbe.decode(bytes)?;
        Ok(0)
    }
}

struct LedFromAux;

impl FrameSink<u8> for LedFromAux {
    fn handle(&mut self, frame: &CompletedFrame, _image: u8) -> anyhow::Result<Vec<ControlMessage>> {
        Ok(vec![ControlMessage::Led(255 - frame.aux.unwrap_or(0))])
    }
}

#[tokio::test]
async fn test_end_to_end_stream_with_feedback() {
    let config = SessionConfig {
        layout: HeaderLayout::WithAux,
        ..receiver_config()
    };
    let chunker = Chunker::new(128, HeaderLayout::WithAux).unwrap();
    let queue = Arc::new(FrameQueue::new(2, OverflowPolicy::Block));
    let (camera, handle, _events) = connect(config, chunker, queue.clone()).await;
    let inbox = camera.start_inbox();

    let images = [synthetic_jpeg(320, 240, 700), synthetic_jpeg(160, 120, 300)];
    let consumer = ConsumerLoop::new(AuxBrightness, LedFromAux).with_commands(handle.commander());
    let consumer = tokio::spawn(consumer.run(queue.clone()));

    for (i, image) in images.iter().enumerate() {
        let fragments = camera.send_frame(image.clone(), Some(i as u8 * 100)).await.unwrap();
        assert!(fragments > 1);
        // Pace frames so the loopback buffer never overflows
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.stats().frames_completed, 2);
    assert_eq!(handle.state(), SessionState::Connected);

    handle.disconnect();
    let stats = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
    assert_eq!(stats.consumed, 2);
    assert_eq!(stats.decode_failures, 0);
    assert_eq!(stats.commands_sent, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        inbox.directives().await,
        vec![ControlMessage::Led(255), ControlMessage::Led(155)]
    );
    // Per-fragment ACKs plus keepalives
    assert!(inbox.acks() > 0);

    let session_stats = handle.join().await;
    assert_eq!(session_stats.last_aux, Some(100));
    inbox.stop();
}

#[tokio::test]
async fn test_recorded_frames_match_sent_images() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(FrameQueue::default());
    let (camera, handle, _events) = connect(receiver_config(), Chunker::default(), queue.clone()).await;

    let recorder = RecordingSink::create(dir.path().join("frames")).unwrap();
    let consumer = tokio::spawn(ConsumerLoop::new(JpegProbe, recorder).run(queue.clone()));

    let image = synthetic_jpeg(64, 64, 3000);
    camera.send_frame(image.clone(), None).await.unwrap();
    timeout(Duration::from_secs(1), async {
        while handle.stats().frames_completed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    handle.disconnect();
    timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();

    let recorded = std::fs::read(dir.path().join("frames").join("frame_000001.jpg")).unwrap();
    assert_eq!(recorded, image.to_vec());
}

#[tokio::test]
async fn test_configured_peer_skips_discovery() {
    let mut camera = CameraEndpoint::bind("127.0.0.1:0".parse().unwrap(), Chunker::default())
        .await
        .unwrap();
    let camera_addr: SocketAddr = camera.local_addr().unwrap();

    let responder = tokio::spawn(async move {
        camera.accept_hello(Duration::from_secs(1)).await.unwrap();
        camera
    });

    let mut session = Session::bind(SessionConfig {
        peer: Some(camera_addr),
        ..receiver_config()
    })
    .await
    .unwrap();
    assert_eq!(session.handshake().await.unwrap(), camera_addr);
    responder.await.unwrap();
    session.disconnect();
    assert_eq!(session.state(), SessionState::Disconnected);
}
