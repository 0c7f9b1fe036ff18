//! Encoding and decoding of everything that goes over the wire: packet headers,
//!  transaction headers, and the fixed-size status report. See the crate-level
//!  documentation for the byte layouts.

use bytes::{Buf, BufMut};

pub mod packet_header;
pub mod status;
pub mod transaction_header;

/// The protocol version this crate speaks. Devices answering with any other version
///  nibble are rejected at decode time.
pub const PROTOCOL_VERSION: u8 = 2;

/// Number of bytes per word. All sizes and budgets in this crate are
///  counted in words unless a name says otherwise.
pub const WORD_BYTES: usize = 4;

/// The byte order a packet was (or is to be) transmitted in. IPbus hardware exists in
///  both flavors, and the packet header is self-describing (see [packet_header]), so
///  decoding works either way. Encoding uses the order configured for the device.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    /// writes one word in this byte order
    pub fn put_u32(self, buf: &mut impl BufMut, word: u32) {
        match self {
            ByteOrder::Big => buf.put_u32(word),
            ByteOrder::Little => buf.put_u32_le(word),
        }
    }

    /// reads one word in this byte order. The caller must have checked that
    ///  at least [WORD_BYTES] bytes remain.
    pub fn get_u32(self, buf: &mut impl Buf) -> u32 {
        match self {
            ByteOrder::Big => buf.get_u32(),
            ByteOrder::Little => buf.get_u32_le(),
        }
    }
}

impl std::fmt::Debug for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteOrder::Big => write!(f, "BE"),
            ByteOrder::Little => write!(f, "LE"),
        }
    }
}
