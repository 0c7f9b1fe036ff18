use crate::wire::{ByteOrder, PROTOCOL_VERSION, WORD_BYTES};
use anyhow::bail;
use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::Debug;

/// The 4-byte header at the start of every packet. Viewed as a big-endian word:
///
/// ```ascii
/// bits 31-28: protocol version (0x2)
/// bits 27-24: reserved, 0
/// bits 23-8:  packet id (u16)
/// bits 7-4:   byte order qualifier, always 0xF
/// bits 3-0:   packet type
/// ```
///
/// The 0xF qualifier nibble ends up in the last byte for big-endian transmission and
///  in the first byte for little-endian transmission, while the version nibble sits
///  at the opposite end. That makes the transmitted byte order detectable from the
///  header itself, which is how [PacketHeader::deser] resolves it.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub packet_id: u16,
    pub packet_type: PacketType,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PKT{{V{}:{:?}@{}}}", PROTOCOL_VERSION, self.packet_type, self.packet_id)
    }
}

impl PacketHeader {
    pub fn new(packet_id: u16, packet_type: PacketType) -> PacketHeader {
        PacketHeader {
            packet_id,
            packet_type,
        }
    }

    /// the header as its logical big-endian word
    pub fn to_word(&self) -> u32 {
        ((PROTOCOL_VERSION as u32) << 28)
            | ((self.packet_id as u32) << 8)
            | 0xf0
            | u8::from(self.packet_type) as u32
    }

    pub fn ser(&self, byte_order: ByteOrder, buf: &mut impl BufMut) {
        byte_order.put_u32(buf, self.to_word());
    }

    /// Decodes a header from the first four bytes of a datagram, resolving the byte
    ///  order from the position of the 0xF qualifier nibble. Fails if the buffer is
    ///  short, if the qualifier is absent from both ends, or if the packet type is
    ///  not a recognized value.
    pub fn deser(raw: &[u8]) -> anyhow::Result<(PacketHeader, ByteOrder)> {
        if raw.len() < WORD_BYTES {
            bail!("insufficient bytes for packet header: need {}, have {}", WORD_BYTES, raw.len());
        }

        let byte_order = if raw[0] >> 4 == PROTOCOL_VERSION && raw[3] & 0xf0 == 0xf0 {
            ByteOrder::Big
        }
        else if raw[3] >> 4 == PROTOCOL_VERSION && raw[0] & 0xf0 == 0xf0 {
            ByteOrder::Little
        }
        else {
            bail!("byte order qualifier on neither end of packet header {:02x?}", &raw[..WORD_BYTES]);
        };

        let word = match byte_order {
            ByteOrder::Big => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            ByteOrder::Little => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        };

        Ok((Self::from_word(word)?, byte_order))
    }

    /// Decodes a header from its logical big-endian word. This is how the history
    ///  buffers of a status packet record headers.
    pub fn from_word(word: u32) -> anyhow::Result<PacketHeader> {
        if (word >> 28) as u8 != PROTOCOL_VERSION {
            bail!("unsupported protocol version {} in packet header word {:08x}", word >> 28, word);
        }
        if word & 0xf0 != 0xf0 {
            bail!("missing byte order qualifier in packet header word {:08x}", word);
        }

        Ok(PacketHeader {
            packet_id: ((word >> 8) & 0xffff) as u16,
            packet_type: PacketType::try_from((word & 0x0f) as u8)?,
        })
    }
}

#[derive(Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Control = 0x0,
    Status = 0x1,
    Resend = 0x2,
}

impl Debug for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Control => write!(f, "CTRL"),
            PacketType::Status => write!(f, "STATUS"),
            PacketType::Resend => write!(f, "RESEND"),
        }
    }
}
