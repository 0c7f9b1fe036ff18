use crate::wire::packet_header::{PacketHeader, PacketType};
use crate::wire::{ByteOrder, WORD_BYTES};
use anyhow::bail;
use bytes::{Buf, BufMut};
use std::fmt::Debug;

/// status packets have a fixed size, requests and replies alike
pub const STATUS_PACKET_LEN: usize = 64;

pub const TRAFFIC_HISTORY_LEN: usize = 16;

const HISTORY_SLOTS: usize = 4;

/// A device's self-description as carried in a status reply. Status packets are
///  always big-endian regardless of the byte order negotiated for control traffic.
///
/// The layout is sixteen words:
///
/// ```ascii
/// word  0:     packet header, id 0, type status
/// word  1:     MTU in bytes
/// word  2:     number of response buffers
/// word  3:     next expected packet id, formatted as a control packet header
/// words 4-7:   traffic history, one event tag per byte
/// words 8-11:  headers of the most recently received control packets
/// words 12-15: headers of the most recently sent control packets
/// ```
///
/// History slots are filled oldest first, with an all-zero word marking an unused
///  slot.
#[derive(Clone, Eq, PartialEq)]
pub struct StatusReport {
    pub mtu: u32,
    pub response_buffers: u32,
    pub next_expected_id: u16,
    pub traffic_history: [u8; TRAFFIC_HISTORY_LEN],
    pub received_headers: Vec<PacketHeader>,
    pub sent_headers: Vec<PacketHeader>,
}

impl Debug for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "STATUS{{mtu:{} buf:{} next:{} rcvd:{:?} sent:{:?}}}",
            self.mtu, self.response_buffers, self.next_expected_id, self.received_headers, self.sent_headers)
    }
}

impl StatusReport {
    /// at most [HISTORY_SLOTS] headers per history are representable, extras are
    ///  silently dropped
    pub fn ser(&self, buf: &mut impl BufMut) {
        PacketHeader::new(0, PacketType::Status).ser(ByteOrder::Big, buf);
        buf.put_u32(self.mtu);
        buf.put_u32(self.response_buffers);
        buf.put_u32(PacketHeader::new(self.next_expected_id, PacketType::Control).to_word());
        buf.put_slice(&self.traffic_history);
        Self::ser_history(&self.received_headers, buf);
        Self::ser_history(&self.sent_headers, buf);
    }

    fn ser_history(headers: &[PacketHeader], buf: &mut impl BufMut) {
        for slot in 0..HISTORY_SLOTS {
            match headers.get(slot) {
                Some(header) => buf.put_u32(header.to_word()),
                None => buf.put_u32(0),
            }
        }
    }

    pub fn deser(raw: &[u8]) -> anyhow::Result<StatusReport> {
        if raw.len() != STATUS_PACKET_LEN {
            bail!("status packet must be {} bytes, got {}", STATUS_PACKET_LEN, raw.len());
        }

        let (header, byte_order) = PacketHeader::deser(raw)?;
        if byte_order != ByteOrder::Big {
            bail!("status packet is not big-endian");
        }
        if header.packet_type != PacketType::Status || header.packet_id != 0 {
            bail!("not a status packet header: {:?}", header);
        }

        let mut buf = &raw[WORD_BYTES..];
        let mtu = buf.get_u32();
        let response_buffers = buf.get_u32();
        let next_expected_id = ((buf.get_u32() >> 8) & 0xffff) as u16;

        let mut traffic_history = [0u8; TRAFFIC_HISTORY_LEN];
        buf.copy_to_slice(&mut traffic_history);

        let received_headers = Self::deser_history(&mut buf)?;
        let sent_headers = Self::deser_history(&mut buf)?;

        Ok(StatusReport {
            mtu,
            response_buffers,
            next_expected_id,
            traffic_history,
            received_headers,
            sent_headers,
        })
    }

    fn deser_history(buf: &mut impl Buf) -> anyhow::Result<Vec<PacketHeader>> {
        let mut headers = Vec::with_capacity(HISTORY_SLOTS);
        for _ in 0..HISTORY_SLOTS {
            let word = buf.get_u32();
            if word != 0 {
                headers.push(PacketHeader::from_word(word)?);
            }
        }
        Ok(headers)
    }
}

/// A status request is a status header padded to the full fixed packet size with
///  zeroes, sent big-endian like all status traffic.
pub fn ser_status_request(buf: &mut impl BufMut) {
    PacketHeader::new(0, PacketType::Status).ser(ByteOrder::Big, buf);
    buf.put_bytes(0, STATUS_PACKET_LEN - WORD_BYTES);
}

/// A resend request is a bare packet header naming the id to retransmit. It goes out
///  in the byte order of regular control traffic and has no reply of its own.
pub fn ser_resend_request(packet_id: u16, byte_order: ByteOrder, buf: &mut impl BufMut) {
    PacketHeader::new(packet_id, PacketType::Resend).ser(byte_order, buf);
}
