//! Datagram header codec, control tokens, and frame chunking for camlink.
//!
//! This crate provides the low-level wire format shared by the camera and the
//! receiving host: the fixed-size fragment header, the whole-datagram text
//! control messages, camera-side chunking of an image into fragments, and the
//! completed-frame type handed downstream after reassembly.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 total_fragments  | big-endian                 |
//! +----------------------+----------------------------+
//! | u16 fragment_index   | big-endian, 0-based        |
//! +----------------------+----------------------------+
//! | u8 aux (opt)         | sensor status, 5-byte mode |
//! +----------------------+----------------------------+
//! | payload              | JPEG chunk (rest of dgram) |
//! +----------------------+----------------------------+
//! ```
//!
//! Control messages (`HELLO`, `ACK`, `LED_128`, ...) are plain UTF-8 datagrams
//! with no header. Nothing on the wire tells the two apart; the receiver
//! decides by session phase.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod control;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use chunk::Chunker;
pub use control::{ControlMessage, ALERT_PORT, DEFAULT_SESSION_PORT};
pub use error::WireError;
pub use frame::CompletedFrame;
pub use header::{
    DataFragment, HeaderLayout, PacketHeader, DEFAULT_BUFFER_SIZE, HEADER_SIZE,
    HEADER_SIZE_WITH_AUX,
};
