//! Reassembled frames.

use bytes::Bytes;

/// A fully reassembled image.
///
/// Built once by the reassembler and then only moved: queue, then consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    /// Completion order, starting at 1 for each session
    pub sequence: u64,
    /// Fragment payloads concatenated in index order
    pub bytes: Bytes,
    /// Aux status carried by fragment 0, if any
    pub aux: Option<u8>,
    /// Number of fragments the frame was split into
    pub fragments: u16,
}

impl CompletedFrame {
    /// Create a new completed frame
    pub fn new(sequence: u64, bytes: Bytes, aux: Option<u8>, fragments: u16) -> Self {
        Self {
            sequence,
            bytes,
            aux,
            fragments,
        }
    }

    /// Frame size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame carries no image bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
