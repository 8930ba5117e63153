//! Consumer side of the frame queue.
//!
//! The core never looks inside image bytes beyond what [`JpegProbe`] needs.
//! Applications plug in their own [`FrameDecoder`] (pixel decode, inference
//! preprocessing) and [`FrameSink`] (display, model, recorder); the sink may
//! return directives that are sent back to the camera or broadcast.

use async_trait::async_trait;
use camlink_wire::{CompletedFrame, ControlMessage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::queue::FrameQueue;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const MARKER_SOS: u8 = 0xDA;

/// Frame decode errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Bytes do not start with a JPEG SOI marker
    #[error("not a jpeg image")]
    NotJpeg,
    /// JPEG EOI marker missing or a segment runs past the end
    #[error("truncated jpeg at offset {0}")]
    Truncated(usize),
    /// Scan data started before any frame header
    #[error("jpeg has no frame header")]
    MissingFrameHeader,
    /// Decoder-specific failure
    #[error("decode failed: {0}")]
    Other(String),
}

/// Turns frame bytes into something a sink can use
pub trait FrameDecoder: Send + Sync {
    /// Decoded representation
    type Image: Send;

    /// Decode one frame
    fn decode(&self, bytes: &[u8]) -> Result<Self::Image, DecodeError>;
}

/// Receives decoded frames, optionally deriving directives
pub trait FrameSink<I>: Send {
    /// Handle one decoded frame and return directives to send
    fn handle(&mut self, frame: &CompletedFrame, image: I) -> anyhow::Result<Vec<ControlMessage>>;

    /// Called once after the queue closes
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<I: Clone, A: FrameSink<I>, B: FrameSink<I>> FrameSink<I> for (A, B) {
    fn handle(&mut self, frame: &CompletedFrame, image: I) -> anyhow::Result<Vec<ControlMessage>> {
        let mut commands = self.0.handle(frame, image.clone())?;
        commands.extend(self.1.handle(frame, image)?);
        Ok(commands)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.0.finish()?;
        self.1.finish()
    }
}

impl<I, S: FrameSink<I>> FrameSink<I> for Option<S> {
    fn handle(&mut self, frame: &CompletedFrame, image: I) -> anyhow::Result<Vec<ControlMessage>> {
        match self {
            Some(sink) => sink.handle(frame, image),
            None => Ok(vec![]),
        }
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self {
            Some(sink) => sink.finish(),
            None => Ok(()),
        }
    }
}

/// Destination for directives derived from frames
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Send a directive
    async fn send_command(&self, message: &ControlMessage) -> std::io::Result<()>;
}

/// Header facts read from a JPEG without decoding pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegInfo {
    /// Image width in pixels
    pub width: u16,
    /// Image height in pixels
    pub height: u16,
    /// Number of colour components
    pub components: u8,
}

/// Validating decoder that only parses JPEG markers
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegProbe;

impl JpegProbe {
    fn is_frame_header(marker: u8) -> bool {
        // SOF0..SOF15 minus DHT, JPG and DAC
        matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
    }

    fn is_standalone(marker: u8) -> bool {
        matches!(marker, 0x01 | 0xD0..=0xD7)
    }
}

impl FrameDecoder for JpegProbe {
    type Image = JpegInfo;

    fn decode(&self, bytes: &[u8]) -> Result<JpegInfo, DecodeError> {
        if bytes.len() < 2 || bytes[..2] != JPEG_SOI {
            return Err(DecodeError::NotJpeg);
        }

        // Camera firmware may pad the last fragment with zeros
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        if end < 4 || bytes[end - 2..end] != JPEG_EOI {
            return Err(DecodeError::Truncated(end));
        }

        let mut pos = 2;
        while pos + 4 <= end {
            if bytes[pos] != 0xFF {
                return Err(DecodeError::Other(format!("expected marker at offset {}", pos)));
            }
            let marker = bytes[pos + 1];
            if marker == 0xFF {
                // Fill byte
                pos += 1;
                continue;
            }
            if Self::is_standalone(marker) {
                pos += 2;
                continue;
            }
            if marker == MARKER_SOS {
                return Err(DecodeError::MissingFrameHeader);
            }

            let segment_len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            if segment_len < 2 || pos + 2 + segment_len > end {
                return Err(DecodeError::Truncated(pos));
            }

            if Self::is_frame_header(marker) {
                if segment_len < 8 {
                    return Err(DecodeError::Truncated(pos));
                }
                let body = &bytes[pos + 4..pos + 2 + segment_len];
                return Ok(JpegInfo {
                    height: u16::from_be_bytes([body[1], body[2]]),
                    width: u16::from_be_bytes([body[3], body[4]]),
                    components: body[5],
                });
            }

            pos += 2 + segment_len;
        }

        Err(DecodeError::MissingFrameHeader)
    }
}

/// Logs every frame
#[derive(Debug, Default)]
pub struct LoggingSink {
    frames: u64,
}

impl LoggingSink {
    /// Create a new logging sink
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSink<JpegInfo> for LoggingSink {
    fn handle(&mut self, frame: &CompletedFrame, image: JpegInfo) -> anyhow::Result<Vec<ControlMessage>> {
        self.frames += 1;
        info!(
            "Frame {}: {}x{} ({} bytes, {} fragments, aux={:?})",
            frame.sequence,
            image.width,
            image.height,
            frame.len(),
            frame.fragments,
            frame.aux
        );
        Ok(vec![])
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        info!("Logged {} frames", self.frames);
        Ok(())
    }
}

/// Writes raw frames into a directory as `frame_<seq>.jpg`
#[derive(Debug)]
pub struct RecordingSink {
    dir: PathBuf,
    written: u64,
}

impl RecordingSink {
    /// Prepare `dir`, removing any frames from a previous recording
    pub fn create<P: AsRef<Path>>(dir: P) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            info!("Clearing existing frames in {:?}", dir);
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        Ok(Self { dir, written: 0 })
    }

    /// Number of frames written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path a frame is stored under
    pub fn frame_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("frame_{:06}.jpg", sequence))
    }
}

impl<I> FrameSink<I> for RecordingSink {
    fn handle(&mut self, frame: &CompletedFrame, _image: I) -> anyhow::Result<Vec<ControlMessage>> {
        let path = self.frame_path(frame.sequence);
        std::fs::write(&path, &frame.bytes)?;
        self.written += 1;
        debug!("Recorded frame {} to {:?}", frame.sequence, path);
        Ok(vec![])
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        info!("Recorded {} frames to {:?}", self.written, self.dir);
        Ok(())
    }
}

/// Images that can report their mean brightness (0.0..=255.0)
pub trait Luminance {
    /// Mean luma of the image
    fn mean_luma(&self) -> f32;
}

/// Drives the camera LED inversely to scene brightness
#[derive(Debug, Default)]
pub struct BrightnessFeedback;

impl BrightnessFeedback {
    /// LED level for a given mean brightness: darker scene, brighter LED
    pub fn led_level(mean_luma: f32) -> u8 {
        let brightness = mean_luma.clamp(0.0, 255.0) as u8;
        255 - brightness
    }
}

impl<I: Luminance> FrameSink<I> for BrightnessFeedback {
    fn handle(&mut self, _frame: &CompletedFrame, image: I) -> anyhow::Result<Vec<ControlMessage>> {
        Ok(vec![ControlMessage::Led(Self::led_level(image.mean_luma()))])
    }
}

/// Counters for a consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Frames popped from the queue
    pub consumed: u64,
    /// Frames the decoder rejected
    pub decode_failures: u64,
    /// Frames the sink failed to handle
    pub sink_errors: u64,
    /// Directives sent
    pub commands_sent: u64,
    /// Directives that failed to send
    pub command_failures: u64,
}

/// Pops frames until the queue closes, decoding and sinking each one
pub struct ConsumerLoop<D, S> {
    decoder: D,
    sink: S,
    commands: Option<Arc<dyn CommandSink>>,
}

impl<D, S> ConsumerLoop<D, S>
where
    D: FrameDecoder,
    S: FrameSink<D::Image>,
{
    /// Create a new consumer loop
    pub fn new(decoder: D, sink: S) -> Self {
        Self {
            decoder,
            sink,
            commands: None,
        }
    }

    /// Route sink directives to `commands`
    pub fn with_commands(mut self, commands: Arc<dyn CommandSink>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Run until the queue is closed and drained
    pub async fn run(mut self, queue: Arc<FrameQueue>) -> ConsumerStats {
        let mut stats = ConsumerStats::default();

        while let Some(frame) = queue.pop().await {
            stats.consumed += 1;

            let image = match self.decoder.decode(&frame.bytes) {
                Ok(image) => image,
                Err(e) => {
                    warn!("Failed to decode frame {}: {}", frame.sequence, e);
                    stats.decode_failures += 1;
                    continue;
                }
            };

            let directives = match self.sink.handle(&frame, image) {
                Ok(directives) => directives,
                Err(e) => {
                    warn!("Sink failed on frame {}: {}", frame.sequence, e);
                    stats.sink_errors += 1;
                    continue;
                }
            };

            let Some(commands) = &self.commands else {
                continue;
            };
            for directive in directives {
                match commands.send_command(&directive).await {
                    Ok(()) => stats.commands_sent += 1,
                    Err(e) => {
                        warn!("Failed to send {}: {}", directive, e);
                        stats.command_failures += 1;
                    }
                }
            }
        }

        if let Err(e) = self.sink.finish() {
            warn!("Sink failed to finish: {}", e);
        }

        debug!("Consumer loop finished: {:?}", stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OverflowPolicy;
    use bytes::Bytes;
    use tokio::sync::Mutex;

    fn synthetic_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut jpeg = vec![0xFF, 0xD8];
        // APP0 JFIF
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpeg.extend_from_slice(b"JFIF\0");
        jpeg.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
        // SOF0, 3 components
        jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        jpeg.extend_from_slice(&height.to_be_bytes());
        jpeg.extend_from_slice(&width.to_be_bytes());
        jpeg.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
        // SOS with a few bytes of scan data
        jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);
        jpeg.extend_from_slice(&[0x12, 0x34, 0x56]);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    fn frame(sequence: u64, bytes: Vec<u8>) -> CompletedFrame {
        CompletedFrame::new(sequence, Bytes::from(bytes), Some(1), 1)
    }

    #[derive(Default)]
    struct RecordedCommands(Mutex<Vec<ControlMessage>>);

    #[async_trait]
    impl CommandSink for RecordedCommands {
        async fn send_command(&self, message: &ControlMessage) -> std::io::Result<()> {
            self.0.lock().await.push(message.clone());
            Ok(())
        }
    }

    #[derive(Clone)]
    struct Gray(f32);

    impl Luminance for Gray {
        fn mean_luma(&self) -> f32 {
            self.0
        }
    }

    struct GrayDecoder;

    impl FrameDecoder for GrayDecoder {
        type Image = Gray;

        fn decode(&self, bytes: &[u8]) -> Result<Gray, DecodeError> {
            bytes
                .first()
                .map(|&b| Gray(b as f32))
                .ok_or_else(|| DecodeError::Other("empty".to_string()))
        }
    }

    #[test]
    fn test_probe_reads_dimensions() {
        let info = JpegProbe.decode(&synthetic_jpeg(320, 240)).unwrap();
        assert_eq!(info, JpegInfo { width: 320, height: 240, components: 3 });
    }

    #[test]
    fn test_probe_tolerates_zero_padding() {
        let mut jpeg = synthetic_jpeg(64, 48);
        jpeg.extend_from_slice(&[0, 0, 0]);
        assert_eq!(JpegProbe.decode(&jpeg).unwrap().width, 64);
    }

    #[test]
    fn test_probe_rejects_garbage() {
        assert_eq!(JpegProbe.decode(b"ABC").unwrap_err(), DecodeError::NotJpeg);

        let mut truncated = synthetic_jpeg(64, 48);
        truncated.truncate(truncated.len() - 2);
        assert!(matches!(JpegProbe.decode(&truncated), Err(DecodeError::Truncated(_))));

        let no_sof = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0xFF, 0xD9];
        assert_eq!(JpegProbe.decode(&no_sof).unwrap_err(), DecodeError::MissingFrameHeader);
    }

    #[test]
    fn test_led_level() {
        assert_eq!(BrightnessFeedback::led_level(0.0), 255);
        assert_eq!(BrightnessFeedback::led_level(200.7), 55);
        assert_eq!(BrightnessFeedback::led_level(300.0), 0);
    }

    #[tokio::test]
    async fn test_consumer_skips_undecodable_frames() {
        let queue = Arc::new(FrameQueue::new(4, OverflowPolicy::Block));
        queue.push(frame(1, synthetic_jpeg(10, 10))).await.unwrap();
        queue.push(frame(2, b"not a jpeg".to_vec())).await.unwrap();
        queue.push(frame(3, synthetic_jpeg(20, 20))).await.unwrap();
        queue.close().await;

        let stats = ConsumerLoop::new(JpegProbe, LoggingSink::new()).run(queue).await;
        assert_eq!(stats.consumed, 3);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.sink_errors, 0);
    }

    #[tokio::test]
    async fn test_brightness_directives_reach_command_sink() {
        let queue = Arc::new(FrameQueue::new(4, OverflowPolicy::Block));
        queue.push(frame(1, vec![10])).await.unwrap();
        queue.push(frame(2, vec![250])).await.unwrap();
        queue.close().await;

        let commands = Arc::new(RecordedCommands::default());
        let stats = ConsumerLoop::new(GrayDecoder, BrightnessFeedback)
            .with_commands(commands.clone())
            .run(queue)
            .await;

        assert_eq!(stats.commands_sent, 2);
        assert_eq!(
            *commands.0.lock().await,
            vec![ControlMessage::Led(245), ControlMessage::Led(5)]
        );
    }

    #[tokio::test]
    async fn test_recording_sink_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("frames");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.jpg"), b"old").unwrap();

        let queue = Arc::new(FrameQueue::new(4, OverflowPolicy::Block));
        let jpeg = synthetic_jpeg(8, 8);
        queue.push(frame(7, jpeg.clone())).await.unwrap();
        queue.close().await;

        let sink = (LoggingSink::new(), RecordingSink::create(&target).unwrap());
        let stats = ConsumerLoop::new(JpegProbe, sink).run(queue).await;
        assert_eq!(stats.consumed, 1);

        assert!(!target.join("stale.jpg").exists());
        assert_eq!(std::fs::read(target.join("frame_000007.jpg")).unwrap(), jpeg);
    }
}
