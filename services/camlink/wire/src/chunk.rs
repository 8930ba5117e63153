//! Image chunking for the camera side.
//!
//! Splits an encoded image into fragments that each fit one datagram buffer.

use bytes::Bytes;
use tracing::trace;

use crate::header::{DataFragment, HeaderLayout, PacketHeader, DEFAULT_BUFFER_SIZE};
use crate::WireError;

/// Chunker for splitting images into datagram-sized fragments
#[derive(Debug, Clone)]
pub struct Chunker {
    layout: HeaderLayout,
    chunk_size: usize,
}

impl Chunker {
    /// Create a chunker for the given datagram buffer size
    pub fn new(buffer_size: usize, layout: HeaderLayout) -> Result<Self, WireError> {
        if buffer_size <= layout.header_len() {
            return Err(WireError::BufferTooSmall(buffer_size));
        }

        Ok(Self {
            layout,
            chunk_size: buffer_size - layout.header_len(),
        })
    }

    /// Payload bytes carried per fragment
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Header layout written by this chunker
    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    /// Split an image into fragments.
    ///
    /// `aux` is stamped on every fragment; the receiver keeps the one from
    /// fragment 0. An empty image yields no fragments.
    pub fn chunk_image(&self, image: Bytes, aux: Option<u8>) -> Result<Vec<DataFragment>, WireError> {
        if image.is_empty() {
            return Ok(vec![]);
        }

        let total_chunks = (image.len() + self.chunk_size - 1) / self.chunk_size;
        let total = u16::try_from(total_chunks).map_err(|_| WireError::TooManyFragments(total_chunks))?;

        let mut fragments = Vec::with_capacity(total_chunks);
        let mut offset = 0;

        for index in 0..total {
            let chunk_end = std::cmp::min(offset + self.chunk_size, image.len());
            let mut header = PacketHeader::new(total, index);
            header.aux = aux;

            fragments.push(DataFragment::new(header, image.slice(offset..chunk_end)));
            offset = chunk_end;
        }

        trace!("Chunked {} byte image into {} fragments", image.len(), total);
        Ok(fragments)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            layout: HeaderLayout::Compact,
            chunk_size: DEFAULT_BUFFER_SIZE - HeaderLayout::Compact.header_len(),
        }
    }
}
