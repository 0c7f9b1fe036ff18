use crate::wire::{ByteOrder, PROTOCOL_VERSION, WORD_BYTES};
use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Display};

/// transaction ids are 12 bits on the wire
pub const MAX_TRANSACTION_ID: u16 = 0x0fff;

/// The 4-byte header in front of every transaction inside a control packet. Viewed
///  as a big-endian word:
///
/// ```ascii
/// bits 31-28: protocol version (0x2)
/// bits 27-16: transaction id (position of the transaction within its packet)
/// bits 15-8:  word count
/// bits 7-4:   transaction type
/// bits 3-0:   info code (0xF on requests, the outcome on replies)
/// ```
///
/// Transaction headers carry no byte order marker of their own; they are encoded in
///  the byte order of their containing packet.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct TransactionHeader {
    /// only the low 12 bits are representable on the wire
    pub transaction_id: u16,
    pub words: u8,
    pub transaction_type: TransactionType,
    pub info_code: InfoCode,
}

impl Debug for TransactionHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TXN{{#{} {:?}x{} {:?}}}", self.transaction_id, self.transaction_type, self.words, self.info_code)
    }
}

impl TransactionHeader {
    /// header for an outbound request, info code fixed to [InfoCode::Request]
    pub fn request(transaction_id: u16, transaction_type: TransactionType, words: u8) -> TransactionHeader {
        TransactionHeader {
            transaction_id,
            words,
            transaction_type,
            info_code: InfoCode::Request,
        }
    }

    pub fn reply(transaction_id: u16, transaction_type: TransactionType, words: u8, info_code: InfoCode) -> TransactionHeader {
        TransactionHeader {
            transaction_id,
            words,
            transaction_type,
            info_code,
        }
    }

    pub fn ser(&self, byte_order: ByteOrder, buf: &mut impl BufMut) {
        let word = ((PROTOCOL_VERSION as u32) << 28)
            | (((self.transaction_id & MAX_TRANSACTION_ID) as u32) << 16)
            | ((self.words as u32) << 8)
            | ((u8::from(self.transaction_type) as u32) << 4)
            | u8::from(self.info_code) as u32;
        byte_order.put_u32(buf, word);
    }

    pub fn deser(buf: &mut impl Buf, byte_order: ByteOrder) -> anyhow::Result<TransactionHeader> {
        if buf.remaining() < WORD_BYTES {
            bail!("insufficient bytes for transaction header: need {}, have {}", WORD_BYTES, buf.remaining());
        }
        let word = byte_order.get_u32(buf);

        let version = (word >> 28) as u8;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {} in transaction header {:08x}", version, word);
        }

        Ok(TransactionHeader {
            transaction_id: ((word >> 16) & 0x0fff) as u16,
            words: ((word >> 8) & 0xff) as u8,
            transaction_type: TransactionType::try_from(((word >> 4) & 0x0f) as u8)?,
            info_code: InfoCode::try_from((word & 0x0f) as u8)?,
        })
    }
}

/// The kind of register operation a transaction performs. The non-incrementing
///  variants re-address the same word, which is what FIFO-style ports need.
#[derive(Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TransactionType {
    Read = 0x0,
    Write = 0x1,
    NonIncRead = 0x2,
    NonIncWrite = 0x3,
    RmwBits = 0x4,
    RmwSum = 0x5,
}

impl Debug for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::Read => write!(f, "RD"),
            TransactionType::Write => write!(f, "WR"),
            TransactionType::NonIncRead => write!(f, "RDNI"),
            TransactionType::NonIncWrite => write!(f, "WRNI"),
            TransactionType::RmwBits => write!(f, "RMWBITS"),
            TransactionType::RmwSum => write!(f, "RMWSUM"),
        }
    }
}

/// The outcome a device reports per transaction. Anything but [InfoCode::Success] on
///  a reply means the bus operation failed on the device; [InfoCode::Request] marks
///  outbound transactions and never appears in a reply.
#[derive(Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum InfoCode {
    Success = 0x0,
    BadHeader = 0x1,
    BusReadError = 0x4,
    BusWriteError = 0x5,
    BusReadTimeout = 0x6,
    BusWriteTimeout = 0x7,
    Request = 0xf,
}

impl InfoCode {
    pub fn is_success(&self) -> bool {
        *self == InfoCode::Success
    }
}

impl Debug for InfoCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfoCode::Success => write!(f, "OK"),
            InfoCode::BadHeader => write!(f, "BAD_HEADER"),
            InfoCode::BusReadError => write!(f, "BUS_RD_ERR"),
            InfoCode::BusWriteError => write!(f, "BUS_WR_ERR"),
            InfoCode::BusReadTimeout => write!(f, "BUS_RD_TIMEOUT"),
            InfoCode::BusWriteTimeout => write!(f, "BUS_WR_TIMEOUT"),
            InfoCode::Request => write!(f, "REQ"),
        }
    }
}

impl Display for InfoCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InfoCode::Success => write!(f, "success"),
            InfoCode::BadHeader => write!(f, "bad transaction header"),
            InfoCode::BusReadError => write!(f, "bus error on read"),
            InfoCode::BusWriteError => write!(f, "bus error on write"),
            InfoCode::BusReadTimeout => write!(f, "bus timeout on read"),
            InfoCode::BusWriteTimeout => write!(f, "bus timeout on write"),
            InfoCode::Request => write!(f, "outbound request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::read_be(TransactionHeader::request(0x123, TransactionType::Read, 0xff), ByteOrder::Big, vec![0x21, 0x23, 0xff, 0x0f])]
    #[case::read_le(TransactionHeader::request(0x123, TransactionType::Read, 0xff), ByteOrder::Little, vec![0x0f, 0xff, 0x23, 0x21])]
    #[case::write_be(TransactionHeader::request(0, TransactionType::Write, 1), ByteOrder::Big, vec![0x20, 0x00, 0x01, 0x1f])]
    #[case::rmw_bits_reply(TransactionHeader::reply(2, TransactionType::RmwBits, 1, InfoCode::Success), ByteOrder::Big, vec![0x20, 0x02, 0x01, 0x40])]
    #[case::read_error_reply(TransactionHeader::reply(1, TransactionType::Read, 0, InfoCode::BusReadError), ByteOrder::Big, vec![0x20, 0x01, 0x00, 0x04])]
    fn test_transaction_header_ser(#[case] header: TransactionHeader, #[case] byte_order: ByteOrder, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(byte_order, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::request(TransactionHeader::request(0, TransactionType::Read, 1))]
    #[case::request_max_id(TransactionHeader::request(0x0fff, TransactionType::NonIncWrite, 255))]
    #[case::reply_ok(TransactionHeader::reply(17, TransactionType::Write, 4, InfoCode::Success))]
    #[case::reply_rmw(TransactionHeader::reply(3, TransactionType::RmwSum, 1, InfoCode::Success))]
    #[case::reply_bus_error(TransactionHeader::reply(9, TransactionType::NonIncRead, 0, InfoCode::BusWriteTimeout))]
    fn test_transaction_header_round_trip(
        #[case] header: TransactionHeader,
        #[values(ByteOrder::Big, ByteOrder::Little)] byte_order: ByteOrder,
    ) {
        let mut buf = BytesMut::new();
        header.ser(byte_order, &mut buf);
        assert_eq!(buf.len(), WORD_BYTES);

        let mut b: &[u8] = buf.as_ref();
        let deser = TransactionHeader::deser(&mut b, byte_order).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::short(vec![0x20, 0x00, 0x01])]
    #[case::wrong_version(vec![0x30, 0x00, 0x01, 0x0f])]
    #[case::unknown_type(vec![0x20, 0x00, 0x01, 0x6f])]
    #[case::unknown_info_code(vec![0x20, 0x00, 0x01, 0x02])]
    fn test_transaction_header_deser_rejects(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = raw.as_ref();
        assert!(TransactionHeader::deser(&mut b, ByteOrder::Big).is_err());
    }

    #[rstest]
    #[case::request(TransactionHeader::request(5, TransactionType::Read, 4), "TXN{#5 RDx4 REQ}")]
    #[case::reply(TransactionHeader::reply(0, TransactionType::RmwBits, 1, InfoCode::BusReadError), "TXN{#0 RMWBITSx1 BUS_RD_ERR}")]
    fn test_transaction_header_debug(#[case] header: TransactionHeader, #[case] expected: &str) {
        assert_eq!(format!("{:?}", header), expected);
    }
}
