//! Camera side of the protocol.
//!
//! [`CameraEndpoint`] announces itself, answers HELLO with ACK and streams
//! frames through a [`Chunker`]. It backs the `simulate` subcommand and the
//! end-to-end tests; an inbox task collects the ACKs and directives the
//! receiver sends back.

use bytes::Bytes;
use camlink_wire::{Chunker, ControlMessage, DataFragment, WireError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::transport::{bind_udp, send_control};

/// Camera endpoint errors
#[derive(Error, Debug)]
pub enum CameraError {
    /// No HELLO arrived in time
    #[error("no HELLO within {0:?}")]
    HelloTimeout(Duration),
    /// Frames can only be sent after a receiver said HELLO
    #[error("no receiver connected")]
    NotConnected,
    /// Image could not be chunked
    #[error("chunking failed: {0}")]
    Wire(#[from] WireError),
    /// Socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Simulated camera
#[derive(Debug)]
pub struct CameraEndpoint {
    socket: Arc<UdpSocket>,
    chunker: Chunker,
    receiver: Option<SocketAddr>,
}

impl CameraEndpoint {
    /// Bind the camera socket
    pub async fn bind(addr: SocketAddr, chunker: Chunker) -> std::io::Result<Self> {
        let socket = bind_udp(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            chunker,
            receiver: None,
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receiver address once HELLO was accepted
    pub fn receiver(&self) -> Option<SocketAddr> {
        self.receiver
    }

    /// Send the discovery announcement to `target` (broadcast or unicast)
    pub async fn announce(&self, target: SocketAddr) -> std::io::Result<()> {
        send_control(&self.socket, target, &ControlMessage::Discovery).await?;
        debug!("Announced camera to {}", target);
        Ok(())
    }

    /// Wait for HELLO and answer with ACK
    pub async fn accept_hello(&mut self, wait: Duration) -> Result<SocketAddr, CameraError> {
        let mut buf = [0u8; 256];
        let hello = async {
            loop {
                let (len, from) = self.socket.recv_from(&mut buf).await?;
                if matches!(ControlMessage::parse(&buf[..len]), Ok(ControlMessage::Hello)) {
                    return Ok::<_, CameraError>(from);
                }
                trace!("Camera ignoring {} bytes from {} before HELLO", len, from);
            }
        };

        let receiver = timeout(wait, hello)
            .await
            .map_err(|_| CameraError::HelloTimeout(wait))??;
        send_control(&self.socket, receiver, &ControlMessage::Ack).await?;
        info!("Camera accepted HELLO from {}", receiver);
        self.receiver = Some(receiver);
        Ok(receiver)
    }

    /// Chunk and send an image, returning the number of fragments sent
    pub async fn send_frame(&self, image: Bytes, aux: Option<u8>) -> Result<usize, CameraError> {
        let fragments = self.chunker.chunk_image(image, aux)?;
        self.send_fragments(&fragments).await?;
        Ok(fragments.len())
    }

    /// Send pre-built fragments in the given order
    pub async fn send_fragments(&self, fragments: &[DataFragment]) -> Result<(), CameraError> {
        let receiver = self.receiver.ok_or(CameraError::NotConnected)?;
        let layout = self.chunker.layout();
        for fragment in fragments {
            self.socket.send_to(&fragment.encode(layout), receiver).await?;
        }
        trace!("Sent {} fragments to {}", fragments.len(), receiver);
        Ok(())
    }

    /// Send raw bytes to the receiver
    pub async fn send_raw(&self, datagram: &[u8]) -> Result<(), CameraError> {
        let receiver = self.receiver.ok_or(CameraError::NotConnected)?;
        self.socket.send_to(datagram, receiver).await?;
        Ok(())
    }

    /// Collect everything the receiver sends from now on
    pub fn start_inbox(&self) -> CameraInbox {
        let state = Arc::new(InboxState::default());
        let socket = self.socket.clone();
        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                    match ControlMessage::parse(&buf[..len]) {
                        Ok(ControlMessage::Ack) => {
                            state.acks.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(message) => {
                            debug!("Camera received {} from {}", message, from);
                            state.directives.lock().await.push(message);
                        }
                        Err(e) => trace!("Camera ignoring datagram from {}: {}", from, e),
                    }
                }
            })
        };
        CameraInbox { state, task }
    }
}

#[derive(Debug, Default)]
struct InboxState {
    acks: AtomicU64,
    directives: Mutex<Vec<ControlMessage>>,
}

/// Messages received by a [`CameraEndpoint`]
#[derive(Debug)]
pub struct CameraInbox {
    state: Arc<InboxState>,
    task: JoinHandle<()>,
}

impl CameraInbox {
    /// ACKs received, keepalive and per-fragment alike
    pub fn acks(&self) -> u64 {
        self.state.acks.load(Ordering::Relaxed)
    }

    /// Non-ACK control messages received, in order
    pub async fn directives(&self) -> Vec<ControlMessage> {
        self.state.directives.lock().await.clone()
    }

    /// Stop collecting
    pub fn stop(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_wire::HeaderLayout;

    #[tokio::test]
    async fn test_send_requires_receiver() {
        let chunker = Chunker::new(16, HeaderLayout::Compact).unwrap();
        let camera = CameraEndpoint::bind("127.0.0.1:0".parse().unwrap(), chunker).await.unwrap();

        let err = camera.send_frame(Bytes::from_static(b"jpeg"), None).await.unwrap_err();
        assert!(matches!(err, CameraError::NotConnected));
    }

    #[tokio::test]
    async fn test_accept_hello_times_out() {
        let mut camera = CameraEndpoint::bind("127.0.0.1:0".parse().unwrap(), Chunker::default())
            .await
            .unwrap();
        let err = camera.accept_hello(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, CameraError::HelloTimeout(_)));
    }
}
