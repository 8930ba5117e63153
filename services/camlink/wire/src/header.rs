//! Fragment header processing for the wire protocol.
//!
//! Every data datagram starts with a 4-byte header (total fragment count and
//! fragment index, both big-endian `u16`). Cameras that report a sensor status
//! alongside the image append one extra byte, giving a 5-byte header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Base header size in bytes (total + index)
pub const HEADER_SIZE: usize = 4;

/// Header size when the aux status byte is present
pub const HEADER_SIZE_WITH_AUX: usize = 5;

/// Default datagram buffer size (header + payload)
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Header variant spoken by the camera firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderLayout {
    /// 4 bytes: total, index
    #[default]
    Compact,
    /// 5 bytes: total, index, aux status
    WithAux,
}

impl HeaderLayout {
    /// Encoded header length for this layout
    pub fn header_len(self) -> usize {
        match self {
            HeaderLayout::Compact => HEADER_SIZE,
            HeaderLayout::WithAux => HEADER_SIZE_WITH_AUX,
        }
    }
}

/// Data fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Number of fragments making up the frame
    pub total_fragments: u16,
    /// 0-based position of this fragment
    pub fragment_index: u16,
    /// Out-of-band sensor status, 5-byte layout only
    pub aux: Option<u8>,
}

impl PacketHeader {
    /// Create a header without aux status
    pub fn new(total_fragments: u16, fragment_index: u16) -> Self {
        Self {
            total_fragments,
            fragment_index,
            aux: None,
        }
    }

    /// Attach an aux status byte
    pub fn with_aux(mut self, aux: u8) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Encode the header (big-endian).
    ///
    /// With [`HeaderLayout::WithAux`] a missing aux byte is written as zero so
    /// the payload offset stays fixed.
    pub fn encode(&self, layout: HeaderLayout, buf: &mut BytesMut) {
        buf.put_u16(self.total_fragments);
        buf.put_u16(self.fragment_index);
        if layout == HeaderLayout::WithAux {
            buf.put_u8(self.aux.unwrap_or(0));
        }
    }

    /// Decode the header, advancing `buf` past it.
    ///
    /// Only the first [`HEADER_SIZE`] bytes are mandatory. In the 5-byte
    /// layout a datagram of exactly four bytes decodes with `aux = None`.
    pub fn decode(buf: &mut Bytes, layout: HeaderLayout) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Malformed {
                len: buf.len(),
                need: HEADER_SIZE,
            });
        }

        let total_fragments = buf.get_u16();
        let fragment_index = buf.get_u16();
        let aux = match layout {
            HeaderLayout::WithAux if buf.has_remaining() => Some(buf.get_u8()),
            _ => None,
        };

        Ok(Self {
            total_fragments,
            fragment_index,
            aux,
        })
    }
}

/// One data datagram: header plus an opaque chunk of the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragment {
    /// Fragment header
    pub header: PacketHeader,
    /// Image bytes carried by this fragment
    pub payload: Bytes,
}

impl DataFragment {
    /// Create a new fragment
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Split a received datagram into header and payload
    pub fn decode(mut datagram: Bytes, layout: HeaderLayout) -> Result<Self, WireError> {
        let header = PacketHeader::decode(&mut datagram, layout)?;
        Ok(Self {
            header,
            payload: datagram,
        })
    }

    /// Serialize the fragment into a single datagram
    pub fn encode(&self, layout: HeaderLayout) -> Bytes {
        let mut buf = BytesMut::with_capacity(layout.header_len() + self.payload.len());
        self.header.encode(layout, &mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Encoded datagram size
    pub fn encoded_len(&self, layout: HeaderLayout) -> usize {
        layout.header_len() + self.payload.len()
    }
}
