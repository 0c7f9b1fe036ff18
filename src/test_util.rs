//! An in-process UDP device emulator. It executes control packets against a
//!  word addressed memory with the strict next-expected-id acceptance rule real
//!  hardware uses, and can be scripted to lose datagrams or answer out of order.

use crate::wire::packet_header::{PacketHeader, PacketType};
use crate::wire::status::{StatusReport, TRAFFIC_HISTORY_LEN};
use crate::wire::transaction_header::{InfoCode, TransactionHeader, TransactionType};
use crate::wire::{ByteOrder, WORD_BYTES};
use bytes::BytesMut;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// the trouble a test wants the device to cause
pub struct DeviceScript {
    pub mtu: u32,
    pub response_buffers: u32,
    /// control packet ids whose reply is swallowed once, as if lost on the wire
    pub drop_reply_for: Vec<u16>,
    /// control packet ids whose request is swallowed once, as if it never arrived
    pub ignore_request_for: Vec<u16>,
    /// when > 1, replies are held back and sent in reverse once this many piled up
    pub reorder_burst: usize,
    /// addresses that answer with a bus error instead of executing
    pub error_addrs: Vec<u32>,
}

impl Default for DeviceScript {
    fn default() -> DeviceScript {
        DeviceScript {
            mtu: 1500,
            response_buffers: 16,
            drop_reply_for: vec![],
            ignore_request_for: vec![],
            reorder_burst: 0,
            error_addrs: vec![],
        }
    }
}

#[derive(Clone, Default)]
pub struct DeviceStats {
    /// control packets that reached the device, including duplicates
    pub control_packets: u64,
    pub status_requests: u64,
    pub resend_requests: u64,
    /// control packets arriving for an id that was already answered
    pub duplicate_requests: u64,
}

pub struct DummyDevice {
    pub addr: SocketAddr,
    stats: Arc<Mutex<DeviceStats>>,
    task: JoinHandle<()>,
}

impl DummyDevice {
    pub async fn start(script: DeviceScript) -> anyhow::Result<DummyDevice> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        debug!("device: listening on {}", addr);

        let stats = Arc::new(Mutex::new(DeviceStats::default()));
        let task = tokio::spawn(run_device(socket, script, stats.clone()));
        Ok(DummyDevice { addr, stats, task })
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().unwrap().clone()
    }
}

impl Drop for DummyDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// last four packet headers each way, what the status report has room for
const HISTORY_DEPTH: usize = 4;

fn push_history(history: &mut VecDeque<u16>, packet_id: u16) {
    if history.len() == HISTORY_DEPTH {
        history.pop_front();
    }
    history.push_back(packet_id);
}

async fn run_device(socket: UdpSocket, script: DeviceScript, stats: Arc<Mutex<DeviceStats>>) {
    let mut memory: FxHashMap<u32, u32> = FxHashMap::default();
    let mut next_expected: u16 = 1;
    let mut received_history: VecDeque<u16> = VecDeque::new();
    let mut sent_history: VecDeque<u16> = VecDeque::new();
    let mut reply_store: FxHashMap<u16, Vec<u8>> = FxHashMap::default();

    let mut drop_reply_for: FxHashSet<u16> = script.drop_reply_for.iter().copied().collect();
    let mut ignore_request_for: FxHashSet<u16> = script.ignore_request_for.iter().copied().collect();
    let mut reorder_buffer: Vec<(SocketAddr, Vec<u8>)> = Vec::new();

    let mut buf = vec![0u8; 65536];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(_) => return,
        };
        let raw = &buf[..len];

        let Ok((header, byte_order)) = PacketHeader::deser(raw) else {
            continue;
        };

        match header.packet_type {
            PacketType::Status => {
                stats.lock().unwrap().status_requests += 1;
                let report = StatusReport {
                    mtu: script.mtu,
                    response_buffers: script.response_buffers,
                    next_expected_id: next_expected,
                    traffic_history: [0; TRAFFIC_HISTORY_LEN],
                    received_headers: received_history.iter().map(|&id| PacketHeader::new(id, PacketType::Control)).collect(),
                    sent_headers: sent_history.iter().map(|&id| PacketHeader::new(id, PacketType::Control)).collect(),
                };
                let mut reply = BytesMut::new();
                report.ser(&mut reply);
                let _ = socket.send_to(&reply, peer).await;
            }
            PacketType::Resend => {
                stats.lock().unwrap().resend_requests += 1;
                if let Some(reply) = reply_store.get(&header.packet_id) {
                    let _ = socket.send_to(reply, peer).await;
                }
            }
            PacketType::Control => {
                if ignore_request_for.remove(&header.packet_id) {
                    debug!("device: pretending packet {} never arrived", header.packet_id);
                    continue;
                }
                stats.lock().unwrap().control_packets += 1;

                if header.packet_id != next_expected {
                    if reply_store.contains_key(&header.packet_id) {
                        stats.lock().unwrap().duplicate_requests += 1;
                    }
                    debug!("device: dropping control packet {} while expecting {}", header.packet_id, next_expected);
                    continue;
                }

                push_history(&mut received_history, header.packet_id);
                let reply = execute_control(&mut memory, &script, header, byte_order, &raw[WORD_BYTES..]);
                next_expected = if next_expected == u16::MAX { 1 } else { next_expected + 1 };
                reply_store.insert(header.packet_id, reply.clone());
                push_history(&mut sent_history, header.packet_id);

                if drop_reply_for.remove(&header.packet_id) {
                    debug!("device: swallowing the reply for packet {}", header.packet_id);
                    continue;
                }

                if script.reorder_burst > 1 {
                    reorder_buffer.push((peer, reply));
                    if reorder_buffer.len() == script.reorder_burst {
                        for (addr, reply) in reorder_buffer.drain(..).rev() {
                            let _ = socket.send_to(&reply, addr).await;
                        }
                    }
                }
                else {
                    let _ = socket.send_to(&reply, peer).await;
                }
            }
        }
    }
}

/// runs a control packet's transactions against the memory and builds the reply
///  datagram, mirroring the request's byte order
fn execute_control(
    memory: &mut FxHashMap<u32, u32>,
    script: &DeviceScript,
    header: PacketHeader,
    byte_order: ByteOrder,
    body: &[u8],
) -> Vec<u8> {
    let mut reply = BytesMut::new();
    header.ser(byte_order, &mut reply);

    let mut buf = body;
    while !buf.is_empty() {
        let Ok(request) = TransactionHeader::deser(&mut buf, byte_order) else {
            break;
        };
        let Some(addr) = take_word(&mut buf, byte_order) else {
            break;
        };

        match request.transaction_type {
            TransactionType::Read | TransactionType::NonIncRead => {
                if script.error_addrs.contains(&addr) {
                    TransactionHeader::reply(request.transaction_id, request.transaction_type, 0, InfoCode::BusReadError)
                        .ser(byte_order, &mut reply);
                    continue;
                }
                TransactionHeader::reply(request.transaction_id, request.transaction_type, request.words, InfoCode::Success)
                    .ser(byte_order, &mut reply);
                for i in 0..request.words as u32 {
                    let word_addr = match request.transaction_type {
                        TransactionType::Read => addr + i,
                        _ => addr,
                    };
                    byte_order.put_u32(&mut reply, memory.get(&word_addr).copied().unwrap_or(0));
                }
            }
            TransactionType::Write | TransactionType::NonIncWrite => {
                let failed = script.error_addrs.contains(&addr);
                for i in 0..request.words as u32 {
                    let Some(word) = take_word(&mut buf, byte_order) else {
                        break;
                    };
                    if failed {
                        continue;
                    }
                    let word_addr = match request.transaction_type {
                        TransactionType::Write => addr + i,
                        _ => addr,
                    };
                    memory.insert(word_addr, word);
                }
                if failed {
                    TransactionHeader::reply(request.transaction_id, request.transaction_type, 0, InfoCode::BusWriteError)
                        .ser(byte_order, &mut reply);
                }
                else {
                    TransactionHeader::reply(request.transaction_id, request.transaction_type, request.words, InfoCode::Success)
                        .ser(byte_order, &mut reply);
                }
            }
            TransactionType::RmwBits => {
                let Some(and_mask) = take_word(&mut buf, byte_order) else {
                    break;
                };
                let Some(or_mask) = take_word(&mut buf, byte_order) else {
                    break;
                };
                let before = memory.get(&addr).copied().unwrap_or(0);
                memory.insert(addr, (before & and_mask) | or_mask);
                TransactionHeader::reply(request.transaction_id, TransactionType::RmwBits, 1, InfoCode::Success)
                    .ser(byte_order, &mut reply);
                byte_order.put_u32(&mut reply, before);
            }
            TransactionType::RmwSum => {
                let Some(addend) = take_word(&mut buf, byte_order) else {
                    break;
                };
                let before = memory.get(&addr).copied().unwrap_or(0);
                memory.insert(addr, before.wrapping_add(addend));
                TransactionHeader::reply(request.transaction_id, TransactionType::RmwSum, 1, InfoCode::Success)
                    .ser(byte_order, &mut reply);
                byte_order.put_u32(&mut reply, before);
            }
        }
    }
    reply.to_vec()
}

fn take_word(buf: &mut &[u8], byte_order: ByteOrder) -> Option<u32> {
    if buf.len() < WORD_BYTES {
        return None;
    }
    Some(byte_order.get_u32(buf))
}
