use crate::engine::EngineInput;
use crate::packet::{Packet, Transaction};
use crate::response::Response;
use crate::wire::ByteOrder;
use anyhow::bail;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// A logical operation as the caller hands it in, before it is cut down to
///  transaction-sized pieces. Word counts are u32 here; the assembler splits
///  anything bigger than a transaction or a packet can carry.
///
/// Each chunk of a split operation carries a clone of `reply_to`, and the last
///  clone is dropped once the operation is fully placed. The channel closing is
///  therefore the caller's signal that all chunk responses have arrived.
#[derive(Debug)]
pub enum Request {
    Read {
        addr: u32,
        words: u32,
        non_incrementing: bool,
        byte_sliced: bool,
        reply_to: UnboundedSender<Response>,
    },
    Write {
        addr: u32,
        data: Vec<u32>,
        non_incrementing: bool,
        reply_to: UnboundedSender<Response>,
    },
    RmwBits {
        addr: u32,
        and_mask: u32,
        or_mask: u32,
        reply_to: UnboundedSender<Response>,
    },
    RmwSum {
        addr: u32,
        addend: u32,
        reply_to: UnboundedSender<Response>,
    },
    /// seal whatever is under construction and resolve `done` once everything
    ///  submitted so far has completed
    Dispatch {
        done: oneshot::Sender<()>,
    },
}

/// one transaction per chunk, so a chunk is capped by the header's word count field
const MAX_CHUNK_WORDS: usize = 255;

/// Cuts incoming operations into transactions and packs them into packets.
///
/// A packet is sealed and handed to the engine when the next chunk does not fit,
///  when it cannot take any further transaction, when the caller dispatches, or
///  when the flush delay expires. Reads split at packet boundaries advance their
///  address chunk by chunk; non-incrementing operations target the same word in
///  every chunk.
pub struct Assembler {
    byte_order: ByteOrder,
    /// body words available per request datagram
    request_budget: usize,
    /// body words the device can send back per reply datagram
    response_budget: usize,
    flush_delay: Option<Duration>,
    current: Option<Packet>,
    deadline: Option<Instant>,
    submit: Sender<EngineInput>,
}

impl Assembler {
    pub fn new(
        byte_order: ByteOrder,
        request_budget: usize,
        response_budget: usize,
        flush_delay: Option<Duration>,
        submit: Sender<EngineInput>,
    ) -> Assembler {
        Assembler {
            byte_order,
            request_budget,
            response_budget,
            flush_delay,
            current: None,
            deadline: None,
            submit,
        }
    }

    async fn on_request(&mut self, request: Request) -> anyhow::Result<()> {
        trace!("assembling {:?}", request);
        match request {
            Request::Read { addr, words, non_incrementing, byte_sliced, reply_to } =>
                self.place_read(addr, words, non_incrementing, byte_sliced, reply_to).await,
            Request::Write { addr, data, non_incrementing, reply_to } =>
                self.place_write(addr, data, non_incrementing, reply_to).await,
            Request::RmwBits { addr, and_mask, or_mask, reply_to } =>
                self.place_transaction(4, Transaction::rmw_bits(addr, and_mask, or_mask, reply_to)).await,
            Request::RmwSum { addr, addend, reply_to } =>
                self.place_transaction(3, Transaction::rmw_sum(addr, addend, reply_to)).await,
            Request::Dispatch { done } => {
                self.seal_and_submit().await?;
                if self.submit.send(EngineInput::Flush(done)).await.is_err() {
                    bail!("engine stopped");
                }
                Ok(())
            }
        }
    }

    async fn place_read(
        &mut self,
        mut addr: u32,
        words: u32,
        non_incrementing: bool,
        byte_sliced: bool,
        reply_to: UnboundedSender<Response>,
    ) -> anyhow::Result<()> {
        let mut words_left = words as usize;
        while words_left > 0 {
            self.make_room(2, 2).await?;
            let packet = self.current_packet();

            let chunk = packet.request_space()
                .min(packet.response_space() - 1)
                .min(words_left)
                .min(MAX_CHUNK_WORDS);
            packet.add(Transaction::read(addr, chunk as u8, non_incrementing, byte_sliced, reply_to.clone()))?;

            if !non_incrementing {
                addr += chunk as u32;
            }
            words_left -= chunk;
            self.arm_deadline();
            self.seal_if_full().await?;
        }
        Ok(())
    }

    async fn place_write(
        &mut self,
        mut addr: u32,
        mut data: Vec<u32>,
        non_incrementing: bool,
        reply_to: UnboundedSender<Response>,
    ) -> anyhow::Result<()> {
        while !data.is_empty() {
            self.make_room(3, 1).await?;
            let packet = self.current_packet();

            let chunk = (packet.request_space() - 2)
                .min(data.len())
                .min(MAX_CHUNK_WORDS);
            let tail = data.split_off(chunk);
            let chunk_words = std::mem::replace(&mut data, tail);
            packet.add(Transaction::write(addr, chunk_words, non_incrementing, reply_to.clone()))?;

            if !non_incrementing {
                addr += chunk as u32;
            }
            self.arm_deadline();
            self.seal_if_full().await?;
        }
        Ok(())
    }

    /// for the RMW operations, which have a fixed footprint and never split
    async fn place_transaction(&mut self, request_words: usize, transaction: Transaction) -> anyhow::Result<()> {
        self.make_room(request_words, 2).await?;
        self.current_packet().add(transaction)?;
        self.arm_deadline();
        self.seal_if_full().await
    }

    /// Seals packets until the current one has the requested space. Budgets are
    ///  validated against the largest fixed footprint at connect time, so a fresh
    ///  packet that still lacks space is a bug worth failing loudly on.
    async fn make_room(&mut self, need_request: usize, need_response: usize) -> anyhow::Result<()> {
        loop {
            let packet = self.current_packet();
            if packet.request_space() >= need_request && packet.response_space() >= need_response {
                return Ok(());
            }
            if packet.is_empty() {
                bail!("packet budgets {}/{} cannot fit a transaction needing {}/{} words",
                    self.request_budget, self.response_budget, need_request, need_response);
            }
            self.seal_and_submit().await?;
        }
    }

    fn current_packet(&mut self) -> &mut Packet {
        self.current.get_or_insert_with(|| Packet::new(self.byte_order, self.request_budget, self.response_budget))
    }

    fn arm_deadline(&mut self) {
        if self.deadline.is_none() {
            if let Some(delay) = self.flush_delay {
                self.deadline = Some(Instant::now() + delay);
            }
        }
    }

    async fn seal_if_full(&mut self) -> anyhow::Result<()> {
        if self.current.as_ref().is_some_and(|packet| packet.is_full()) {
            self.seal_and_submit().await?;
        }
        Ok(())
    }

    async fn seal_and_submit(&mut self) -> anyhow::Result<()> {
        self.deadline = None;
        if let Some(packet) = self.current.take() {
            if packet.is_empty() {
                return Ok(());
            }
            trace!("submitting {:?}", packet);
            if self.submit.send(EngineInput::Submit(packet)).await.is_err() {
                bail!("engine stopped");
            }
        }
        Ok(())
    }
}

pub async fn run_assembler(mut assembler: Assembler, mut requests: UnboundedReceiver<Request>) -> anyhow::Result<()> {
    loop {
        let deadline = assembler.deadline;
        let deadline_expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        select! {
            request = requests.recv() => match request {
                Some(request) => assembler.on_request(request).await?,
                None => {
                    // callers are gone; push out what is left and wind down
                    assembler.seal_and_submit().await?;
                    return Ok(());
                }
            },
            _ = deadline_expired => assembler.seal_and_submit().await?,
        }
    }
}
