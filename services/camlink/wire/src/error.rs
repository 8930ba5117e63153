//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header
    #[error("malformed packet: {len} bytes, header needs {need}")]
    Malformed {
        /// Bytes actually received
        len: usize,
        /// Minimum bytes required
        need: usize,
    },

    /// Image would need more fragments than the u16 counter can express
    #[error("too many fragments: {0}")]
    TooManyFragments(usize),

    /// Datagram buffer cannot hold a header plus at least one payload byte
    #[error("buffer too small: {0}")]
    BufferTooSmall(usize),

    /// Control datagram is not valid UTF-8
    #[error("control message is not text")]
    NotText,

    /// LED directive carries a value outside 0..=255
    #[error("invalid led level: {0}")]
    LedLevel(String),
}
