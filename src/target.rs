use crate::assembler::{run_assembler, Assembler, Request};
use crate::config::TargetConfig;
use crate::engine::{exchange_status, run_reader, Engine, EngineInput};
use crate::register::Register;
use crate::response::Response;
use crate::send_socket::SendSocket;
use crate::wire::status::StatusReport;
use crate::wire::WORD_BYTES;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc::{channel, unbounded_channel, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// smallest packet that fits any single transaction, i.e. an RMW request
const MIN_BUDGET_WORDS: usize = 4;

/// A connected device. This is the application-facing handle: it owns the socket
///  reader, the assembler and the engine as background tasks and talks to them
///  through channels.
///
/// Operations queue work and hand back a stream of [Response]s, one per
///  transaction put on the wire; the stream ends once the device has answered
///  all of them. An operation larger than the device's MTU is split
///  transparently and fans out into several responses. Responses arrive in
///  submission order regardless of how datagrams fared on the wire, and a
///  stream never ends silently: teardown delivers error responses first.
///
/// Dropping the target tears the background tasks down immediately. [Target::stop]
///  does the same but lets outstanding operations end with an error response
///  instead of hanging up on them.
#[derive(Debug)]
pub struct Target {
    name: String,
    requests: UnboundedSender<Request>,
    stop: Sender<()>,
    device_status: StatusReport,
    registers: FxHashMap<String, Register>,
    reader: JoinHandle<()>,
    engine: JoinHandle<anyhow::Result<()>>,
    assembler: JoinHandle<anyhow::Result<()>>,
}

impl Target {
    /// Binds a local socket, runs the initial status exchange and starts the
    ///  background tasks. The register table comes from whoever parsed the
    ///  device's address map; operations take any [Register], the table just
    ///  serves name lookups. Fails if the device stays silent or reports an MTU
    ///  too small to fit a single transaction.
    pub async fn connect(
        name: &str,
        addr: impl ToSocketAddrs,
        registers: Vec<Register>,
        config: TargetConfig,
    ) -> anyhow::Result<Target> {
        config.validate()?;

        let mut table = FxHashMap::default();
        for register in registers {
            if let Some(previous) = table.insert(register.name.clone(), register) {
                bail!("duplicate register name {}", previous.name);
            }
        }

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(addr).await?;
        info!("{}: connecting to {:?} from {:?}", name, socket.peer_addr().ok(), socket.local_addr().ok());

        let (reply_tx, reply_rx) = unbounded_channel();
        let (status_tx, mut status_rx) = unbounded_channel();
        let reader = tokio::spawn(run_reader(socket.clone(), reply_tx, status_tx));

        let device_status = match exchange_status(name, &socket, &mut status_rx, config.status_attempts, config.status_timeout).await {
            Ok(status) => status,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };
        info!("{}: {:?}", name, device_status);

        let budget = (device_status.mtu as usize / WORD_BYTES).saturating_sub(1);
        if budget < MIN_BUDGET_WORDS {
            reader.abort();
            bail!("{}: device mtu of {} bytes cannot fit a transaction", name, device_status.mtu);
        }

        let send_socket: Arc<dyn SendSocket> = Arc::new(socket.clone());
        let engine = Engine::new(name.to_string(), send_socket, &config, &device_status, status_rx);
        let (input_tx, input_rx) = channel(config.queued_capacity);
        let (stop_tx, stop_rx) = channel(1);
        let engine = tokio::spawn(engine.run(input_rx, reply_rx, stop_rx));

        let assembler = Assembler::new(config.byte_order, budget, budget, config.flush_delay, input_tx);
        let (request_tx, request_rx) = unbounded_channel();
        let assembler = tokio::spawn(run_assembler(assembler, request_rx));

        Ok(Target {
            name: name.to_string(),
            requests: request_tx,
            stop: stop_tx,
            device_status,
            registers: table,
            reader,
            engine,
            assembler,
        })
    }

    /// the device's answer to the connect-time status exchange
    pub fn device_status(&self) -> &StatusReport {
        &self.device_status
    }

    pub fn register(&self, name: &str) -> anyhow::Result<&Register> {
        self.registers.get(name).ok_or_else(|| anyhow!("{}: no register named {}", self.name, name))
    }

    /// Queues a read of `words` words from the register. Ports are read from
    ///  their fixed address `words` times, which is how a FIFO is drained.
    pub fn read(&self, register: &Register, words: u32) -> anyhow::Result<UnboundedReceiver<Response>> {
        self.check_span(register, words as usize)?;
        let (reply_to, rx) = unbounded_channel();
        self.submit(Request::Read {
            addr: register.addr,
            words,
            non_incrementing: register.non_incrementing,
            byte_sliced: false,
            reply_to,
        })?;
        Ok(rx)
    }

    /// like [Target::read], but the responses carry the raw wire bytes
    pub fn read_bytes(&self, register: &Register, words: u32) -> anyhow::Result<UnboundedReceiver<Response>> {
        self.check_span(register, words as usize)?;
        let (reply_to, rx) = unbounded_channel();
        self.submit(Request::Read {
            addr: register.addr,
            words,
            non_incrementing: register.non_incrementing,
            byte_sliced: true,
            reply_to,
        })?;
        Ok(rx)
    }

    /// Queues a write of `data` to the register. Writes to a port land on its
    ///  fixed address word by word, which is how a FIFO is filled.
    pub fn write(&self, register: &Register, data: &[u32]) -> anyhow::Result<UnboundedReceiver<Response>> {
        self.check_span(register, data.len())?;
        let (reply_to, rx) = unbounded_channel();
        self.submit(Request::Write {
            addr: register.addr,
            data: data.to_vec(),
            non_incrementing: register.non_incrementing,
            reply_to,
        })?;
        Ok(rx)
    }

    /// Queues an atomic update of the register to `(value & and_mask) | or_mask`.
    ///  The single response carries the value from before the modification.
    pub fn rmw_bits(&self, register: &Register, and_mask: u32, or_mask: u32) -> anyhow::Result<UnboundedReceiver<Response>> {
        let (reply_to, rx) = unbounded_channel();
        self.submit(Request::RmwBits { addr: register.addr, and_mask, or_mask, reply_to })?;
        Ok(rx)
    }

    /// Queues an atomic addition of `addend` to the register. The single
    ///  response carries the value from before the modification.
    pub fn rmw_sum(&self, register: &Register, addend: u32) -> anyhow::Result<UnboundedReceiver<Response>> {
        let (reply_to, rx) = unbounded_channel();
        self.submit(Request::RmwSum { addr: register.addr, addend, reply_to })?;
        Ok(rx)
    }

    /// Seals the packet under construction and waits until everything submitted so
    ///  far has been answered. This is what makes batching without a flush delay
    ///  usable: queue operations, then dispatch, then drain their streams.
    pub async fn dispatch(&self) -> anyhow::Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.submit(Request::Dispatch { done })?;
        done_rx.await.map_err(|_| anyhow!("{}: stopped before the flush completed", self.name))
    }

    /// Stops the background tasks. Outstanding operations end with an error
    ///  response; the device keeps whatever it has already executed.
    pub async fn stop(&self) {
        debug!("{}: stopping", self.name);
        let _ = self.stop.send(()).await;
    }

    fn submit(&self, request: Request) -> anyhow::Result<()> {
        self.requests.send(request).map_err(|_| anyhow!("{}: target is stopped", self.name))
    }

    /// a span check only makes sense for incrementing registers, ports are
    ///  re-addressed arbitrarily often
    fn check_span(&self, register: &Register, words: usize) -> anyhow::Result<()> {
        if !register.non_incrementing && words > register.size as usize {
            bail!("{}: {} words do not fit register {} of size {}", self.name, words, register.name, register.size);
        }
        Ok(())
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.reader.abort();
        self.engine.abort();
        self.assembler.abort();
    }
}
