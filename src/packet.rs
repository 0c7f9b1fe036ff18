use crate::response::Response;
use crate::wire::packet_header::{PacketHeader, PacketType};
use crate::wire::transaction_header::{TransactionHeader, TransactionType, MAX_TRANSACTION_ID};
use crate::wire::{ByteOrder, WORD_BYTES};
use anyhow::{anyhow, bail};
use bytes::{Buf, BytesMut};
use std::fmt::Debug;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// One register operation inside a packet, together with the channel its response
///  goes to. Word counts are limited to a u8 by the wire format; callers split
///  larger operations into several transactions before they get here.
pub struct Transaction {
    pub transaction_type: TransactionType,
    /// the word count for the transaction header. Data words for reads and writes,
    ///  fixed at 1 for RMW operations.
    pub words: u8,
    pub addr: u32,
    /// write data or RMW operands, empty for reads
    pub input: Vec<u32>,
    /// deliver the reply payload as raw wire bytes instead of decoded words
    pub byte_sliced: bool,
    pub reply_to: UnboundedSender<Response>,
    /// position in the enclosing packet, assigned by [Packet::add]
    pub transaction_id: Option<u16>,
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{:#010x}x{}", self.transaction_type, self.addr, self.words)
    }
}

impl Transaction {
    pub fn read(addr: u32, words: u8, non_incrementing: bool, byte_sliced: bool, reply_to: UnboundedSender<Response>) -> Transaction {
        Transaction {
            transaction_type: if non_incrementing { TransactionType::NonIncRead } else { TransactionType::Read },
            words,
            addr,
            input: Vec::new(),
            byte_sliced,
            reply_to,
            transaction_id: None,
        }
    }

    /// callers keep `data` within 255 words, see [crate::assembler]
    pub fn write(addr: u32, data: Vec<u32>, non_incrementing: bool, reply_to: UnboundedSender<Response>) -> Transaction {
        Transaction {
            transaction_type: if non_incrementing { TransactionType::NonIncWrite } else { TransactionType::Write },
            words: data.len() as u8,
            addr,
            input: data,
            byte_sliced: false,
            reply_to,
            transaction_id: None,
        }
    }

    pub fn rmw_bits(addr: u32, and_mask: u32, or_mask: u32, reply_to: UnboundedSender<Response>) -> Transaction {
        Transaction {
            transaction_type: TransactionType::RmwBits,
            words: 1,
            addr,
            input: vec![and_mask, or_mask],
            byte_sliced: false,
            reply_to,
            transaction_id: None,
        }
    }

    pub fn rmw_sum(addr: u32, addend: u32, reply_to: UnboundedSender<Response>) -> Transaction {
        Transaction {
            transaction_type: TransactionType::RmwSum,
            words: 1,
            addr,
            input: vec![addend],
            byte_sliced: false,
            reply_to,
            transaction_id: None,
        }
    }

    /// Validates the transaction's shape and returns its footprint as
    ///  (request words, response words), headers included.
    fn cost(&self) -> anyhow::Result<(usize, usize)> {
        if self.byte_sliced && !matches!(self.transaction_type, TransactionType::Read | TransactionType::NonIncRead) {
            bail!("byte-sliced replies only apply to reads");
        }

        match self.transaction_type {
            TransactionType::Read | TransactionType::NonIncRead => {
                if !self.input.is_empty() {
                    bail!("read transactions carry no input data");
                }
                Ok((2, 1 + self.words as usize))
            }
            TransactionType::Write | TransactionType::NonIncWrite => {
                if self.input.len() != self.words as usize {
                    bail!("write data length {} does not match word count {}", self.input.len(), self.words);
                }
                Ok((2 + self.words as usize, 1))
            }
            TransactionType::RmwBits => {
                if self.input.len() != 2 {
                    bail!("RMW bits takes an AND mask and an OR mask, got {} input words", self.input.len());
                }
                if self.words != 1 {
                    bail!("RMW transactions have a word count of 1, got {}", self.words);
                }
                Ok((4, 2))
            }
            TransactionType::RmwSum => {
                if self.input.len() != 1 {
                    bail!("RMW sum takes a single addend, got {} input words", self.input.len());
                }
                if self.words != 1 {
                    bail!("RMW transactions have a word count of 1, got {}", self.words);
                }
                Ok((3, 2))
            }
        }
    }
}

/// A control packet under construction or in flight: the pre-encoded request
///  datagram plus the transactions awaiting their part of the reply.
///
/// Space is budgeted in words on both sides. The request budget limits the datagram
///  this packet encodes to; the response budget limits the reply the device will
///  send back, which the device's MTU caps just like the request. [Packet::add]
///  refuses transactions that overrun either budget and leaves the packet untouched,
///  so a caller can seal the packet and retry on a fresh one.
pub struct Packet {
    header: PacketHeader,
    byte_order: ByteOrder,
    transactions: Vec<Transaction>,
    request: BytesMut,
    request_space: usize,
    response_space: usize,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{:?} txns:{} req_space:{} resp_space:{}}}",
            self.header, self.transactions.len(), self.request_space, self.response_space)
    }
}

impl Packet {
    /// Budgets count body words, excluding the packet header word. The packet id
    ///  starts out as 0 and is patched in by [Packet::assign_packet_id] when the
    ///  packet is put on the wire.
    pub fn new(byte_order: ByteOrder, request_budget: usize, response_budget: usize) -> Packet {
        let header = PacketHeader::new(0, PacketType::Control);
        let mut request = BytesMut::with_capacity((request_budget + 1) * WORD_BYTES);
        header.ser(byte_order, &mut request);

        Packet {
            header,
            byte_order,
            transactions: Vec::new(),
            request,
            request_space: request_budget,
            response_space: response_budget,
        }
    }

    pub fn packet_id(&self) -> u16 {
        self.header.packet_id
    }

    /// patches the id into the already encoded request header
    pub fn assign_packet_id(&mut self, packet_id: u16) {
        self.header.packet_id = packet_id;
        match self.byte_order {
            ByteOrder::Big => self.request[1..3].copy_from_slice(&packet_id.to_be_bytes()),
            ByteOrder::Little => self.request[1..3].copy_from_slice(&packet_id.to_le_bytes()),
        }
    }

    pub fn request_bytes(&self) -> &[u8] {
        self.request.as_ref()
    }

    pub fn request_space(&self) -> usize {
        self.request_space
    }

    pub fn response_space(&self) -> usize {
        self.response_space
    }

    pub fn num_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// no further transaction of any kind can fit
    pub fn is_full(&self) -> bool {
        self.request_space < 2 || self.response_space < 2
    }

    /// Appends a transaction, encoding its request words in place. The transaction
    ///  id is its position in the packet. On error the packet is left unmodified.
    pub fn add(&mut self, mut transaction: Transaction) -> anyhow::Result<()> {
        let transaction_id = self.transactions.len();
        if transaction_id > MAX_TRANSACTION_ID as usize {
            bail!("packet already holds {} transactions, the id field is exhausted", self.transactions.len());
        }

        let (request_words, response_words) = transaction.cost()?;
        if request_words > self.request_space || response_words > self.response_space {
            bail!("{:?} does not fit: needs {}/{} words, space is {}/{}",
                transaction, request_words, response_words, self.request_space, self.response_space);
        }

        transaction.transaction_id = Some(transaction_id as u16);
        TransactionHeader::request(transaction_id as u16, transaction.transaction_type, transaction.words)
            .ser(self.byte_order, &mut self.request);
        self.byte_order.put_u32(&mut self.request, transaction.addr);
        for word in &transaction.input {
            self.byte_order.put_u32(&mut self.request, *word);
        }

        self.request_space -= request_words;
        self.response_space -= response_words;
        self.transactions.push(transaction);
        Ok(())
    }

    /// Matches a reply body (the datagram after its packet header) against this
    ///  packet's transactions, consuming the packet. Returns one response per
    ///  transaction, paired with its reply channel, in transaction order.
    ///
    /// A malformed transaction reply desynchronizes the parse: that transaction and
    ///  every later one get an error response. A non-success info code is a valid
    ///  reply, reported through the response, and parsing continues behind it.
    pub fn parse_reply(self, body: &[u8], byte_order: ByteOrder) -> Vec<(UnboundedSender<Response>, Response)> {
        let mut out = Vec::with_capacity(self.transactions.len());
        let mut buf = body;

        for (index, transaction) in self.transactions.into_iter().enumerate() {
            let response = match Self::parse_transaction_reply(&mut buf, byte_order, index, &transaction) {
                Ok(response) => response,
                Err(e) => {
                    buf = &[];
                    Response::missing(e)
                }
            };
            out.push((transaction.reply_to, response));
        }

        if !buf.is_empty() {
            warn!("ignoring {} trailing bytes after the last transaction reply", buf.len());
        }
        out
    }

    fn parse_transaction_reply(
        buf: &mut &[u8],
        byte_order: ByteOrder,
        index: usize,
        transaction: &Transaction,
    ) -> anyhow::Result<Response> {
        let header = TransactionHeader::deser(buf, byte_order)?;
        if header.transaction_id != index as u16 {
            bail!("reply transaction id {} does not match position {}", header.transaction_id, index);
        }
        if header.transaction_type != transaction.transaction_type {
            bail!("reply type {:?} does not match request {:?} at position {}",
                header.transaction_type, transaction.transaction_type, index);
        }

        let payload_words = match transaction.transaction_type {
            TransactionType::Read | TransactionType::NonIncRead => header.words as usize,
            TransactionType::Write | TransactionType::NonIncWrite => 0,
            TransactionType::RmwBits | TransactionType::RmwSum => {
                if header.info_code.is_success() { 1 } else { 0 }
            }
        };

        if buf.len() < payload_words * WORD_BYTES {
            bail!("insufficient bytes for reply payload at position {}: need {}, have {}",
                index, payload_words * WORD_BYTES, buf.len());
        }

        if transaction.byte_sliced {
            let bytes = buf[..payload_words * WORD_BYTES].to_vec();
            buf.advance(payload_words * WORD_BYTES);
            Ok(Response::of_bytes(header.info_code, bytes))
        }
        else {
            let mut words = Vec::with_capacity(payload_words);
            for _ in 0..payload_words {
                words.push(byte_order.get_u32(buf));
            }
            Ok(Response::of_words(header.info_code, words))
        }
    }

    /// Ends every transaction in this packet with an error response, for teardown
    ///  paths where no reply will ever come.
    pub fn fail(self, reason: &str) -> Vec<(UnboundedSender<Response>, Response)> {
        self.transactions
            .into_iter()
            .map(|transaction| (transaction.reply_to, Response::missing(anyhow!("{}", reason))))
            .collect()
    }
}
