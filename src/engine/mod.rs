use crate::config::TargetConfig;
use crate::packet::Packet;
use crate::response::Response;
use crate::send_socket::SendSocket;
use crate::wire::packet_header::PacketHeader;
use crate::wire::status::{ser_resend_request, ser_status_request, StatusReport, STATUS_PACKET_LEN};
use crate::wire::{ByteOrder, WORD_BYTES};
use anyhow::bail;
use bytes::BytesMut;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{Receiver, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub mod id_queue;

use id_queue::IdQueue;

/// A packet that is out on the wire awaiting its reply.
struct Flight {
    packet: Packet,
    /// refreshed on retransmission
    sent_at: Instant,
}

/// what the assembler hands to the engine
#[derive(Debug)]
pub enum EngineInput {
    Submit(Packet),
    /// resolved once every packet submitted before it has been released
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
pub struct EngineStats {
    pub packets_sent: u64,
    pub packets_released: u64,
    pub transactions_released: u64,
    pub timeouts: u64,
    pub resend_requests: u64,
    pub retransmissions: u64,
    pub duplicate_replies: u64,
}

impl EngineStats {
    fn is_quiet(&self) -> bool {
        self.packets_sent == 0
            && self.packets_released == 0
            && self.timeouts == 0
            && self.duplicate_replies == 0
    }
}

impl Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sent {} packets, released {} ({} transactions), {} timeouts, {} resend requests, {} retransmissions, {} duplicate replies",
            self.packets_sent, self.packets_released, self.transactions_released,
            self.timeouts, self.resend_requests, self.retransmissions, self.duplicate_replies)
    }
}

/// The reliability core: it puts sealed packets on the wire inside the device's
///  window, matches replies to them, recovers from lost datagrams, and releases
///  responses to callers strictly in submission order.
///
/// The engine owns all of its state and runs as a single task; the socket reader
///  and the assembler talk to it through channels (see [run_reader] and
///  [crate::assembler]).
pub struct Engine {
    name: String,
    socket: Arc<dyn SendSocket>,
    byte_order: ByteOrder,
    flight_timeout: Duration,
    status_timeout: Duration,
    status_attempts: usize,
    report_interval: Duration,
    queued_capacity: usize,
    /// never more unacknowledged packets than this on the wire
    window: usize,

    /// 0 is reserved for status traffic, ids wrap from 65535 back to 1
    next_packet_id: u16,
    queued: VecDeque<Packet>,
    flying: FxHashMap<u16, Flight>,
    /// parsed responses of replied packets that earlier packets still hold back
    replied: FxHashMap<u16, Vec<(UnboundedSender<Response>, Response)>>,
    /// sent but not yet released packet ids, in send order
    release_order: IdQueue,
    /// ids that were retransmitted or had their reply re-requested in the current
    ///  recovery episode; late duplicate replies for these are dropped silently
    recently_resent: FxHashSet<u16>,
    /// reply deadline of the oldest unacknowledged packet
    deadline: Option<Instant>,
    inputs_closed: bool,

    submitted_packets: u64,
    released_packets: u64,
    flush_marks: VecDeque<(u64, oneshot::Sender<()>)>,

    status_rx: UnboundedReceiver<Vec<u8>>,
    stats: EngineStats,
}

impl Engine {
    /// `status` is the device's answer to the connect-time status exchange; the
    ///  engine adopts the packet id the device expects next and caps its window at
    ///  the device's response buffer count.
    pub fn new(
        name: String,
        socket: Arc<dyn SendSocket>,
        config: &TargetConfig,
        status: &StatusReport,
        status_rx: UnboundedReceiver<Vec<u8>>,
    ) -> Engine {
        let window = if status.response_buffers > 0 {
            config.max_flight.min(status.response_buffers as usize)
        }
        else {
            config.max_flight
        };

        Engine {
            name,
            socket,
            byte_order: config.byte_order,
            flight_timeout: config.flight_timeout,
            status_timeout: config.status_timeout,
            status_attempts: config.status_attempts,
            report_interval: config.report_interval,
            queued_capacity: config.queued_capacity,
            window,
            next_packet_id: if status.next_expected_id == 0 { 1 } else { status.next_expected_id },
            queued: VecDeque::new(),
            flying: FxHashMap::default(),
            replied: FxHashMap::default(),
            // room for a window of unreplied packets plus a window of replies
            //  stalled behind a missing one; sending pauses when it fills up
            release_order: IdQueue::new(2 * window),
            recently_resent: FxHashSet::default(),
            deadline: None,
            inputs_closed: false,
            submitted_packets: 0,
            released_packets: 0,
            flush_marks: VecDeque::new(),
            status_rx,
            stats: EngineStats::default(),
        }
    }

    pub async fn run(
        mut self,
        mut inputs: Receiver<EngineInput>,
        mut replies: UnboundedReceiver<(PacketHeader, ByteOrder, Vec<u8>)>,
        mut stop: Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("{}: engine starting, window is {} packets", self.name, self.window);

        let result = self.run_loop(&mut inputs, &mut replies, &mut stop).await;
        match &result {
            Ok(()) => debug!("{}: engine stopped", self.name),
            Err(e) => {
                error!("{}: engine failed: {:#}", self.name, e);
                self.fail_everything(&format!("engine failed: {:#}", e));
            }
        }
        result
    }

    async fn run_loop(
        &mut self,
        inputs: &mut Receiver<EngineInput>,
        replies: &mut UnboundedReceiver<(PacketHeader, ByteOrder, Vec<u8>)>,
        stop: &mut Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut report_ticks = interval(self.report_interval);
        report_ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.deadline;
            let timeout_expired = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            select! {
                input = inputs.recv(), if !self.inputs_closed && self.queued.len() < self.queued_capacity => match input {
                    Some(EngineInput::Submit(packet)) => self.on_submit(packet).await?,
                    Some(EngineInput::Flush(done)) => self.on_flush(done),
                    None => self.inputs_closed = true,
                },
                reply = replies.recv() => match reply {
                    Some((header, byte_order, raw)) => self.on_reply(header, byte_order, &raw).await?,
                    None => bail!("socket reader stopped"),
                },
                _ = timeout_expired => self.on_timeout().await?,
                _ = report_ticks.tick() => self.report(),
                _ = stop.recv() => {
                    info!("{}: stop requested", self.name);
                    self.fail_everything("target stopped");
                    return Ok(());
                }
            }

            if self.inputs_closed && self.is_drained() {
                return Ok(());
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.queued.is_empty() && self.flying.is_empty() && self.release_order.is_empty()
    }

    async fn on_submit(&mut self, packet: Packet) -> anyhow::Result<()> {
        self.submitted_packets += 1;
        self.queued.push_back(packet);
        self.send_next().await
    }

    fn on_flush(&mut self, done: oneshot::Sender<()>) {
        if self.submitted_packets <= self.released_packets {
            let _ = done.send(());
        }
        else {
            self.flush_marks.push_back((self.submitted_packets, done));
        }
    }

    /// moves queued packets onto the wire until the window is used up
    async fn send_next(&mut self) -> anyhow::Result<()> {
        while self.flying.len() < self.window && !self.release_order.is_full() {
            let Some(mut packet) = self.queued.pop_front() else {
                break;
            };

            let packet_id = self.next_packet_id;
            self.next_packet_id = if packet_id == u16::MAX { 1 } else { packet_id + 1 };
            packet.assign_packet_id(packet_id);
            self.release_order.push(packet_id)?;

            trace!("{}: sending {:?}", self.name, packet);
            self.socket.send_datagram(packet.request_bytes()).await?;

            self.flying.insert(packet_id, Flight { packet, sent_at: Instant::now() });
            self.stats.packets_sent += 1;
        }
        self.rearm_deadline();
        Ok(())
    }

    async fn on_reply(&mut self, header: PacketHeader, byte_order: ByteOrder, raw: &[u8]) -> anyhow::Result<()> {
        let packet_id = header.packet_id;
        let Some(flight) = self.flying.remove(&packet_id) else {
            if self.recently_resent.contains(&packet_id) {
                debug!("{}: dropping duplicate reply for packet {}", self.name, packet_id);
                self.stats.duplicate_replies += 1;
                return Ok(());
            }
            bail!("reply for packet {} which is not in flight", packet_id);
        };

        trace!("{}: reply for packet {}, {} bytes", self.name, packet_id, raw.len());
        let responses = flight.packet.parse_reply(&raw[WORD_BYTES..], byte_order);
        self.replied.insert(packet_id, responses);

        self.release_in_order();
        self.send_next().await
    }

    /// Hands out responses strictly in send order: a replied packet is held back
    ///  until every packet sent before it has been released.
    fn release_in_order(&mut self) {
        while let Some(front) = self.release_order.oldest() {
            let Some(responses) = self.replied.remove(&front) else {
                break;
            };
            self.release_order.pop_oldest();

            for (reply_to, response) in responses {
                self.stats.transactions_released += 1;
                let _ = reply_to.send(response);
            }
            self.released_packets += 1;
            self.stats.packets_released += 1;
        }
        self.fire_flush_marks();
    }

    fn fire_flush_marks(&mut self) {
        while self.flush_marks.front().is_some_and(|(mark, _)| *mark <= self.released_packets) {
            if let Some((_, done)) = self.flush_marks.pop_front() {
                let _ = done.send(());
            }
        }
    }

    /// Loss recovery. The oldest unacknowledged packet went unanswered for the
    ///  flight timeout; the device's status tells us which side lost a datagram:
    ///
    /// * sent history contains the id: the reply got lost, ask for a resend
    /// * received but never sent: the device sits on the request, no way forward
    /// * neither: the request got lost, put the whole window on the wire again
    async fn on_timeout(&mut self) -> anyhow::Result<()> {
        self.deadline = None;
        let Some(lost_id) = self.release_order.oldest() else {
            return Ok(());
        };
        self.stats.timeouts += 1;
        let newest = self.release_order.newest().unwrap_or(lost_id);
        warn!("{}: no reply for packet {} within {:?} ({} unreleased up to packet {}), starting loss recovery",
            self.name, lost_id, self.flight_timeout, self.release_order.len(), newest);

        self.recently_resent.clear();
        let status = self.query_status().await?;

        if status.sent_headers.iter().any(|h| h.packet_id == lost_id) {
            info!("{}: device already answered packet {}, requesting a resend of the reply", self.name, lost_id);
            let mut buf = BytesMut::with_capacity(WORD_BYTES);
            ser_resend_request(lost_id, self.byte_order, &mut buf);
            self.socket.send_datagram(buf.as_ref()).await?;

            if let Some(flight) = self.flying.get_mut(&lost_id) {
                flight.sent_at = Instant::now();
            }
            self.recently_resent.insert(lost_id);
            self.stats.resend_requests += 1;
        }
        else if status.received_headers.iter().any(|h| h.packet_id == lost_id) {
            bail!("device received packet {} but never answered it", lost_id);
        }
        else {
            info!("{}: device never saw packet {}, retransmitting {} packets", self.name, lost_id, self.flying.len());
            let socket = self.socket.clone();
            let window_ids = self.release_order.iter()
                .filter(|id| self.flying.contains_key(id))
                .collect::<Vec<_>>();
            for packet_id in window_ids {
                if let Some(flight) = self.flying.get_mut(&packet_id) {
                    socket.send_datagram(flight.packet.request_bytes()).await?;
                    flight.sent_at = Instant::now();
                }
                self.recently_resent.insert(packet_id);
                self.stats.retransmissions += 1;
            }
        }

        self.rearm_deadline();
        self.send_next().await
    }

    async fn query_status(&mut self) -> anyhow::Result<StatusReport> {
        // leftovers from an earlier recovery episode would be answers to the wrong
        //  question
        while self.status_rx.try_recv().is_ok() {}

        let status = exchange_status(
            &self.name,
            self.socket.as_ref(),
            &mut self.status_rx,
            self.status_attempts,
            self.status_timeout,
        ).await?;
        debug!("{}: {:?}", self.name, status);
        Ok(status)
    }

    /// The front of the release order is never sitting in the replied stash (it
    ///  would have been released), so it is the oldest packet awaiting its reply.
    fn oldest_flight(&self) -> Option<&Flight> {
        self.release_order.oldest().and_then(|id| self.flying.get(&id))
    }

    fn rearm_deadline(&mut self) {
        self.deadline = self.oldest_flight().map(|flight| flight.sent_at + self.flight_timeout);
    }

    fn report(&mut self) {
        if self.stats.is_quiet() {
            return;
        }
        info!("{}: {} ({} in flight, {} queued)", self.name, self.stats, self.flying.len(), self.queued.len());
        self.stats = EngineStats::default();
    }

    /// Ends every outstanding transaction with an error response, in send order as
    ///  far as one exists. Dispatch waiters see their oneshot close.
    fn fail_everything(&mut self, reason: &str) {
        while let Some(packet_id) = self.release_order.pop_oldest() {
            if let Some(responses) = self.replied.remove(&packet_id) {
                for (reply_to, response) in responses {
                    let _ = reply_to.send(response);
                }
            }
            else if let Some(flight) = self.flying.remove(&packet_id) {
                for (reply_to, response) in flight.packet.fail(reason) {
                    let _ = reply_to.send(response);
                }
            }
        }
        while let Some(packet) = self.queued.pop_front() {
            for (reply_to, response) in packet.fail(reason) {
                let _ = reply_to.send(response);
            }
        }
        self.flush_marks.clear();
    }
}

/// Listens on the socket and routes datagrams: packet id 0 is status traffic for
///  whoever is waiting on a status exchange, everything else is a control reply for
///  the engine. Unparsable datagrams are dropped; a socket error stops the reader,
///  which the engine treats as fatal.
pub async fn run_reader(
    socket: Arc<UdpSocket>,
    replies: UnboundedSender<(PacketHeader, ByteOrder, Vec<u8>)>,
    status: UnboundedSender<Vec<u8>>,
) {
    debug!("starting receive loop on {:?}", socket.local_addr().ok());

    let mut buf = vec![0u8; 65536];
    loop {
        let len = match socket.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                error!("socket error: {}", e);
                return;
            }
        };
        let raw = buf[..len].to_vec();

        let (header, byte_order) = match PacketHeader::deser(&raw) {
            Ok(x) => x,
            Err(e) => {
                warn!("received datagram with unparsable header, dropping: {:#}", e);
                continue;
            }
        };

        let routed = if header.packet_id == 0 {
            status.send(raw).is_ok()
        }
        else {
            replies.send((header, byte_order, raw)).is_ok()
        };
        if !routed {
            // engine gone, nothing left to route to
            return;
        }
    }
}

/// One status exchange: send the request, await the reply, retry on silence or
///  garbage. Shared between connect (where it discovers the device) and the
///  engine's loss recovery.
pub async fn exchange_status(
    name: &str,
    socket: &dyn SendSocket,
    status_rx: &mut UnboundedReceiver<Vec<u8>>,
    attempts: usize,
    per_attempt: Duration,
) -> anyhow::Result<StatusReport> {
    for attempt in 1..=attempts {
        let mut buf = BytesMut::with_capacity(STATUS_PACKET_LEN);
        ser_status_request(&mut buf);
        socket.send_datagram(buf.as_ref()).await?;

        match timeout(per_attempt, status_rx.recv()).await {
            Ok(Some(raw)) => match StatusReport::deser(&raw) {
                Ok(report) => return Ok(report),
                Err(e) => warn!("{}: malformed status reply on attempt {}: {:#}", name, attempt, e),
            },
            Ok(None) => bail!("socket reader stopped"),
            Err(_) => warn!("{}: no status reply within {:?} (attempt {}/{})", name, per_attempt, attempt, attempts),
        }
    }
    bail!("device unreachable: {} status queries went unanswered", attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Transaction;
    use crate::send_socket::MockSendSocket;
    use crate::wire::packet_header::PacketType;
    use crate::wire::transaction_header::{InfoCode, TransactionHeader, TransactionType};
    use mockall::Sequence;
    use tokio::sync::mpsc::{channel, unbounded_channel};

    fn test_config(max_flight: usize) -> TargetConfig {
        TargetConfig {
            max_flight,
            flight_timeout: Duration::from_millis(100),
            status_timeout: Duration::from_millis(50),
            status_attempts: 3,
            ..TargetConfig::default_big_endian()
        }
    }

    fn device_status(response_buffers: u32, next_expected_id: u16) -> StatusReport {
        StatusReport {
            mtu: 1500,
            response_buffers,
            next_expected_id,
            traffic_history: [0; 16],
            received_headers: vec![],
            sent_headers: vec![],
        }
    }

    fn engine_with(mock: MockSendSocket, max_flight: usize) -> Engine {
        let (_status_tx, status_rx) = unbounded_channel();
        Engine::new("test".to_string(), Arc::new(mock), &test_config(max_flight), &device_status(16, 1), status_rx)
    }

    fn read_packet(addr: u32) -> (Packet, tokio::sync::mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = unbounded_channel();
        let mut packet = Packet::new(ByteOrder::Big, 100, 100);
        packet.add(Transaction::read(addr, 1, false, false, tx)).unwrap();
        (packet, rx)
    }

    /// the exact datagram the engine puts on the wire for [read_packet]
    fn expected_request(packet_id: u16, addr: u32) -> Vec<u8> {
        let (mut packet, _rx) = read_packet(addr);
        packet.assign_packet_id(packet_id);
        packet.request_bytes().to_vec()
    }

    fn read_reply(packet_id: u16, word: u32) -> (PacketHeader, Vec<u8>) {
        let header = PacketHeader::new(packet_id, PacketType::Control);
        let mut raw = BytesMut::new();
        header.ser(ByteOrder::Big, &mut raw);
        TransactionHeader::reply(0, TransactionType::Read, 1, InfoCode::Success).ser(ByteOrder::Big, &mut raw);
        ByteOrder::Big.put_u32(&mut raw, word);
        (header, raw.to_vec())
    }

    fn status_reply(sent: &[u16], received: &[u16]) -> Vec<u8> {
        let report = StatusReport {
            mtu: 1500,
            response_buffers: 16,
            next_expected_id: 0,
            traffic_history: [0; 16],
            received_headers: received.iter().map(|&id| PacketHeader::new(id, PacketType::Control)).collect(),
            sent_headers: sent.iter().map(|&id| PacketHeader::new(id, PacketType::Control)).collect(),
        };
        let mut buf = BytesMut::new();
        report.ser(&mut buf);
        buf.to_vec()
    }

    fn is_status_request(buf: &[u8]) -> bool {
        buf.len() == STATUS_PACKET_LEN && buf[..WORD_BYTES] == [0x20, 0x00, 0x00, 0xf1]
    }

    #[test]
    fn test_new_adopts_device_packet_id_and_caps_window() {
        let (_tx, status_rx) = unbounded_channel();
        let engine = Engine::new("t".to_string(), Arc::new(MockSendSocket::new()), &test_config(8), &device_status(4, 37), status_rx);
        assert_eq!(engine.next_packet_id, 37);
        assert_eq!(engine.window, 4);

        let (_tx, status_rx) = unbounded_channel();
        let engine = Engine::new("t".to_string(), Arc::new(MockSendSocket::new()), &test_config(8), &device_status(0, 0), status_rx);
        assert_eq!(engine.next_packet_id, 1);
        assert_eq!(engine.window, 8);
    }

    #[tokio::test]
    async fn test_packet_ids_wrap_around_skipping_zero() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(2).returning(|_| Ok(()));
        let mut engine = engine_with(mock, 4);
        engine.next_packet_id = u16::MAX;

        let (p1, _rx1) = read_packet(0x10);
        let (p2, _rx2) = read_packet(0x20);
        engine.on_submit(p1).await.unwrap();
        engine.on_submit(p2).await.unwrap();

        assert_eq!(engine.release_order.iter().collect::<Vec<_>>(), vec![u16::MAX, 1]);
        assert_eq!(engine.next_packet_id, 2);
    }

    #[tokio::test]
    async fn test_window_bounds_packets_in_flight() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(5).returning(|_| Ok(()));
        let mut engine = engine_with(mock, 4);

        let mut receivers = Vec::new();
        for i in 0..6 {
            let (packet, rx) = read_packet(0x100 + i);
            engine.on_submit(packet).await.unwrap();
            receivers.push(rx);
        }
        assert_eq!(engine.flying.len(), 4);
        assert_eq!(engine.queued.len(), 2);

        let (header, raw) = read_reply(1, 0xaffe);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();

        // the freed slot is refilled from the queue
        assert_eq!(engine.flying.len(), 4);
        assert_eq!(engine.queued.len(), 1);
        assert_eq!(receivers[0].try_recv().unwrap().into_word().unwrap(), 0xaffe);
    }

    #[tokio::test]
    async fn test_stalled_releases_pause_sending_before_the_id_queue_fills() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(5).returning(|_| Ok(()));
        let mut engine = engine_with(mock, 2);

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (packet, rx) = read_packet(0x100 + i);
            engine.on_submit(packet).await.unwrap();
            receivers.push(rx);
        }
        // everything but the oldest packet gets its reply
        for packet_id in [2u16, 3, 4] {
            let (header, raw) = read_reply(packet_id, packet_id as u32);
            engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        }

        // ids 1..=4 are unreleased and fill the queue, packet 5 has to wait
        assert!(engine.release_order.is_full());
        assert_eq!(engine.queued.len(), 1);

        let (header, raw) = read_reply(1, 1);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert_eq!(engine.release_order.iter().collect::<Vec<_>>(), vec![5]);
        assert_eq!(engine.queued.len(), 0);
    }

    #[tokio::test]
    async fn test_responses_released_in_send_order() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(3).returning(|_| Ok(()));
        let mut engine = engine_with(mock, 4);

        let (tx, mut rx) = unbounded_channel();
        for addr in [0x10, 0x20, 0x30] {
            let mut packet = Packet::new(ByteOrder::Big, 100, 100);
            packet.add(Transaction::read(addr, 1, false, false, tx.clone())).unwrap();
            engine.on_submit(packet).await.unwrap();
        }

        let (header, raw) = read_reply(3, 30);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert!(rx.try_recv().is_err(), "reply for packet 3 must wait for 1 and 2");

        let (header, raw) = read_reply(1, 10);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().into_word().unwrap(), 10);
        assert!(rx.try_recv().is_err(), "reply for packet 3 must wait for 2");

        let (header, raw) = read_reply(2, 20);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().into_word().unwrap(), 20);
        assert_eq!(rx.try_recv().unwrap().into_word().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_reply_for_unknown_packet_is_fatal() {
        let mut engine = engine_with(MockSendSocket::new(), 4);

        let (header, raw) = read_reply(7, 0);
        let err = engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap_err();
        assert!(err.to_string().contains("not in flight"));
    }

    #[tokio::test]
    async fn test_flush_with_nothing_outstanding_resolves_immediately() {
        let mut engine = engine_with(MockSendSocket::new(), 4);

        let (done_tx, mut done_rx) = oneshot::channel();
        engine.on_flush(done_tx);
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_flush_resolves_once_submitted_packets_are_released() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(2).returning(|_| Ok(()));
        let mut engine = engine_with(mock, 1);

        let (p1, _rx1) = read_packet(0x10);
        let (p2, _rx2) = read_packet(0x20);
        engine.on_submit(p1).await.unwrap();
        engine.on_submit(p2).await.unwrap();

        let (done_tx, mut done_rx) = oneshot::channel();
        engine.on_flush(done_tx);
        assert!(done_rx.try_recv().is_err());

        let (header, raw) = read_reply(1, 0);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert!(done_rx.try_recv().is_err(), "packet 2 is still outstanding");

        let (header, raw) = read_reply(2, 0);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_requests_resend_when_the_reply_was_lost() {
        let (status_tx, status_rx) = unbounded_channel();
        let mut seq = Sequence::new();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(1, 0x10))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(2, 0x20))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let injected = status_reply(&[1], &[1]);
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(1).in_sequence(&mut seq)
            .returning(move |_| {
                status_tx.send(injected.clone()).unwrap();
                Ok(())
            });
        mock.expect_send_datagram()
            .withf(|buf| buf == [0x20, 0x00, 0x01, 0xf2])
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(2), &device_status(16, 1), status_rx);
        let (p1, mut rx1) = read_packet(0x10);
        let (p2, _rx2) = read_packet(0x20);
        engine.on_submit(p1).await.unwrap();
        engine.on_submit(p2).await.unwrap();

        engine.on_timeout().await.unwrap();

        assert!(engine.flying.contains_key(&1) && engine.flying.contains_key(&2));
        assert!(engine.recently_resent.contains(&1));
        assert!(engine.deadline.is_some());
        assert_eq!(engine.stats.resend_requests, 1);
        assert_eq!(engine.stats.retransmissions, 0);

        // the re-requested reply arrives, then the late original shows up as well
        let (header, raw) = read_reply(1, 0x11);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert_eq!(rx1.try_recv().unwrap().into_word().unwrap(), 0x11);

        let (header, raw) = read_reply(1, 0x11);
        engine.on_reply(header, ByteOrder::Big, &raw).await.unwrap();
        assert_eq!(engine.stats.duplicate_replies, 1);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_retransmits_the_window_when_the_request_was_lost() {
        let (status_tx, status_rx) = unbounded_channel();
        let mut seq = Sequence::new();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(1, 0x10))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(2, 0x20))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let injected = status_reply(&[], &[]);
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(1).in_sequence(&mut seq)
            .returning(move |_| {
                status_tx.send(injected.clone()).unwrap();
                Ok(())
            });
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(1, 0x10))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(2, 0x20))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(2), &device_status(16, 1), status_rx);
        let (p1, _rx1) = read_packet(0x10);
        let (p2, _rx2) = read_packet(0x20);
        engine.on_submit(p1).await.unwrap();
        engine.on_submit(p2).await.unwrap();

        engine.on_timeout().await.unwrap();

        assert!(engine.recently_resent.contains(&1) && engine.recently_resent.contains(&2));
        assert_eq!(engine.stats.retransmissions, 2);
        assert_eq!(engine.stats.resend_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_gives_up_when_the_device_swallowed_the_request() {
        let (status_tx, status_rx) = unbounded_channel();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .withf(|buf| !is_status_request(buf))
            .times(1)
            .returning(|_| Ok(()));
        let injected = status_reply(&[], &[1]);
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(1)
            .returning(move |_| {
                status_tx.send(injected.clone()).unwrap();
                Ok(())
            });

        let mut engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(1), &device_status(16, 1), status_rx);
        let (p1, _rx1) = read_packet(0x10);
        engine.on_submit(p1).await.unwrap();

        let err = engine.on_timeout().await.unwrap_err();
        assert!(err.to_string().contains("never answered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_retries_the_status_query_and_gives_up() {
        let (_status_tx, status_rx) = unbounded_channel();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .withf(|buf| !is_status_request(buf))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(3)
            .returning(|_| Ok(()));

        let mut engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(1), &device_status(16, 1), status_rx);
        let (p1, _rx1) = read_packet(0x10);
        engine.on_submit(p1).await.unwrap();

        let err = engine.on_timeout().await.unwrap_err();
        assert!(err.to_string().contains("unanswered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_survives_a_malformed_status_reply() {
        let (status_tx, status_rx) = unbounded_channel();
        let mut seq = Sequence::new();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .withf(|buf| !is_status_request(buf))
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let garbage_tx = status_tx.clone();
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(1).in_sequence(&mut seq)
            .returning(move |_| {
                garbage_tx.send(vec![0xff; 10]).unwrap();
                Ok(())
            });
        let injected = status_reply(&[1], &[1]);
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(1).in_sequence(&mut seq)
            .returning(move |_| {
                status_tx.send(injected.clone()).unwrap();
                Ok(())
            });
        mock.expect_send_datagram()
            .withf(|buf| buf == [0x20, 0x00, 0x01, 0xf2])
            .times(1).in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(1), &device_status(16, 1), status_rx);
        let (p1, _rx1) = read_packet(0x10);
        engine.on_submit(p1).await.unwrap();

        engine.on_timeout().await.unwrap();
        assert!(engine.recently_resent.contains(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_ignores_stale_status_replies() {
        let (status_tx, status_rx) = unbounded_channel();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .withf(|buf| !is_status_request(buf))
            .times(1)
            .returning(|_| Ok(()));
        let fresh_tx = status_tx.clone();
        let injected = status_reply(&[], &[]);
        mock.expect_send_datagram()
            .withf(|buf| is_status_request(buf))
            .times(1)
            .returning(move |_| {
                fresh_tx.send(injected.clone()).unwrap();
                Ok(())
            });
        mock.expect_send_datagram()
            .withf(|buf| buf == expected_request(1, 0x10))
            .times(1)
            .returning(|_| Ok(()));

        let mut engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(1), &device_status(16, 1), status_rx);
        let (p1, _rx1) = read_packet(0x10);
        engine.on_submit(p1).await.unwrap();

        // a leftover reply claiming packet 1 was answered must not trick the
        //  recovery into the resend branch
        status_tx.send(status_reply(&[1], &[1])).unwrap();

        engine.on_timeout().await.unwrap();
        assert_eq!(engine.stats.retransmissions, 1);
        assert_eq!(engine.stats.resend_requests, 0);
    }

    #[tokio::test]
    async fn test_fail_everything_ends_all_outstanding_transactions() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(1).returning(|_| Ok(()));
        let mut engine = engine_with(mock, 1);

        let (p1, mut rx1) = read_packet(0x10);
        let (p2, mut rx2) = read_packet(0x20);
        engine.on_submit(p1).await.unwrap();
        engine.on_submit(p2).await.unwrap();
        let (done_tx, mut done_rx) = oneshot::channel();
        engine.on_flush(done_tx);

        engine.fail_everything("target stopped");

        let flying_response = rx1.try_recv().unwrap();
        assert!(!flying_response.is_ok());
        let queued_response = rx2.try_recv().unwrap();
        assert!(!queued_response.is_ok());
        assert!(done_rx.try_recv().is_err());
        assert!(engine.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_delivers_replies_and_stops_when_inputs_close() {
        let (reply_tx, reply_rx) = unbounded_channel();
        let device_tx = reply_tx.clone();
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram()
            .times(1)
            .returning(move |buf| {
                let packet_id = u16::from_be_bytes([buf[1], buf[2]]);
                let (header, raw) = read_reply(packet_id, 42);
                device_tx.send((header, ByteOrder::Big, raw)).unwrap();
                Ok(())
            });

        let (_status_tx, status_rx) = unbounded_channel();
        let engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(4), &device_status(16, 1), status_rx);
        let (input_tx, input_rx) = channel(16);
        let (_stop_tx, stop_rx) = channel(1);
        let handle = tokio::spawn(engine.run(input_rx, reply_rx, stop_rx));

        let (packet, mut rx) = read_packet(0x10);
        input_tx.send(EngineInput::Submit(packet)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().into_word().unwrap(), 42);

        drop(input_tx);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_request_and_errors_outstanding_work() {
        let mut mock = MockSendSocket::new();
        mock.expect_send_datagram().times(1).returning(|_| Ok(()));

        let (_status_tx, status_rx) = unbounded_channel();
        let engine = Engine::new("test".to_string(), Arc::new(mock), &test_config(4), &device_status(16, 1), status_rx);
        let (input_tx, input_rx) = channel(16);
        let (_reply_tx, reply_rx) = unbounded_channel();
        let (stop_tx, stop_rx) = channel(1);
        let handle = tokio::spawn(engine.run(input_rx, reply_rx, stop_rx));

        let (packet, mut rx) = read_packet(0x10);
        input_tx.send(EngineInput::Submit(packet)).await.unwrap();
        // paused time advances only once the engine has gone idle, so the
        //  packet is on the wire before the stop arrives
        tokio::time::sleep(Duration::from_millis(1)).await;

        stop_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        let response = rx.recv().await.unwrap();
        assert!(!response.is_ok());
    }
}
