//! UDP handshake, keepalive, frame reassembly, and receive loop for camlink.
//!
//! A receiver talks to exactly one camera. The session discovers the camera
//! (or uses a configured address), exchanges HELLO/ACK, and then treats every
//! datagram from the camera as a data fragment until it is disconnected.
//!
//! ## Features
//!
//! - **Discovery**: waits for the camera's broadcast announcement
//! - **Handshake**: single-attempt HELLO/ACK, fails closed
//! - **Keepalive**: periodic ACK while connected
//! - **Reassembly**: one in-flight frame, index-0 reset, gap detection
//! - **Camera simulator**: the peer side for tests and demos
//!
//! ## Example
//!
//! ```rust,no_run
//! use camlink_delivery::FrameQueue;
//! use camlink_session::{Session, SessionConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut session = Session::bind(SessionConfig::default()).await?;
//! let camera = session.handshake().await?;
//! println!("Connected to {}", camera);
//!
//! let queue = Arc::new(FrameQueue::default());
//! let handle = session.start(queue.clone())?;
//!
//! while let Some(frame) = queue.pop().await {
//!     println!("Frame {}: {} bytes", frame.sequence, frame.len());
//! }
//! handle.join().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod camera;
pub mod commander;
pub mod handshake;
pub mod keepalive;
pub mod reassembly;
mod receive;
pub mod session;
pub mod stats;
pub mod transport;

// Re-export main types
pub use camera::{CameraEndpoint, CameraError, CameraInbox};
pub use commander::PeerCommander;
pub use handshake::{await_discovery, exchange_hello, HandshakeError};
pub use keepalive::run_keepalive;
pub use reassembly::{DropReason, Reassembler, ReassemblyEvent};
pub use session::{
    Session, SessionConfig, SessionError, SessionEvent, SessionHandle, SessionState,
};
pub use stats::{SessionCounters, SessionStats};
pub use transport::{bind_udp, send_control};
