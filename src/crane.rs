//! Cranes — multiplexed duplex links between two hubs.
//!
//! A crane rides one pre-established secure byte stream and carries many
//! independent flows over it, each ending in a [`Terminal`]. Flow 0 is the
//! controller: always present, strictly prioritised over terminal traffic
//! by the writer loop. Backpressure is the bounded outbound queue — a full
//! queue blocks the sending terminal, which is the intended signal.
//!
//! One reader task dispatches inbound frames by flow id; one writer task
//! drains the controller channel first on every iteration, then coalesces
//! terminal messages into a single write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CraneCodec, Frame};
use crate::error::{FlowError, FlowErrorKind};
use crate::hub::Hub;
use crate::mailbox::Mailbox;
use crate::metrics::{
    CRANE_BYTES_IN, CRANE_BYTES_OUT, CRANE_FRAMES_IN, CRANE_FRAMES_OUT, TERMINALS_ACTIVE,
};
use crate::msg::{Msg, MsgKind};
use crate::ops::{ControllerOp, GossipQueryOp, GossipSource, HubAnnouncement};
use crate::terminal::{
    OutboundSink, Terminal, TerminalOpts, TerminalSpawn, TerminalState,
    DEFAULT_IDLE_TIMEOUT, PUBLIC_REMOTE_IDLE_TIMEOUT,
};
use crate::unit::Scheduler;

/// The controller flow id. Never assigned to a user terminal.
pub const CONTROLLER_FLOW_ID: u32 = 0;

/// Bound of the prioritised controller channel.
const CONTROLLER_QUEUE_SIZE: usize = 32;

/// Bound of the shared terminal queue.
const TERMINAL_QUEUE_SIZE: usize = 128;

/// At most this many messages are coalesced into one write.
const MAX_SHIPMENT_MSGS: usize = 32;

/// Coalescing stops once a shipment reaches this many bytes.
const MAX_SHIPMENT_SIZE: usize = 64 * 1024;

/// Any transport a crane can ride: the secure channel is established
/// elsewhere and handed in type-erased.
pub trait CraneTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> CraneTransport for T {}

/// Construction flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CraneOpts {
    /// Whether this side initiated the crane.
    pub mine: bool,
    /// Whether the crane serves public lane traffic. Remote terminals on
    /// public cranes get the longer idle timeout.
    pub public: bool,
}

/// Network-facing optimisation state: when the navigator last suggested
/// this crane, and whether it is scheduled for retirement.
#[derive(Debug)]
pub struct NetState {
    last_suggested_at: StdMutex<Instant>,
    stopping: AtomicBool,
}

impl NetState {
    fn new() -> Self {
        Self {
            last_suggested_at: StdMutex::new(Instant::now()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn update_last_suggested_at(&self) {
        *self
            .last_suggested_at
            .lock()
            .expect("net state lock poisoned") = Instant::now();
    }

    pub fn last_suggested_at(&self) -> Instant {
        *self
            .last_suggested_at
            .lock()
            .expect("net state lock poisoned")
    }

    /// Atomically set the stopping mark. False when already marked.
    pub fn mark_stopping(&self) -> bool {
        self.stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically clear the stopping mark. False when it was not set, so a
    /// mark/abort pair leaves the state exactly as before.
    pub fn abort_stopping(&self) -> bool {
        self.stopping
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

struct FlowEntry {
    terminal: Arc<Terminal>,
    inbound_tx: mpsc::Sender<Msg>,
}

/// One multiplexed hub link. See the module docs.
pub struct Crane {
    hub: Hub,
    opts: CraneOpts,
    public: AtomicBool,
    pub net_state: NetState,
    scheduler: Scheduler,
    terminals: StdMutex<HashMap<u32, FlowEntry>>,
    next_flow_id: StdMutex<u32>,
    controller: Arc<Terminal>,
    controller_tx: mpsc::Sender<Msg>,
    terminal_msgs: Arc<Mailbox>,
    reaper_tx: mpsc::UnboundedSender<u32>,
    incoming_tx: mpsc::UnboundedSender<Arc<Terminal>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Terminal>>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    next_op_id: AtomicU64,
    pending_ops: StdMutex<HashMap<u64, oneshot::Sender<Result<Vec<HubAnnouncement>, FlowError>>>>,
    gossip_source: StdMutex<Option<Arc<dyn GossipSource>>>,
}

impl Crane {
    /// Build a crane over `transport` and spawn its reader, writer and
    /// controller tasks.
    pub fn new(
        hub: Hub,
        transport: Box<dyn CraneTransport>,
        scheduler: Scheduler,
        opts: CraneOpts,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(transport);
        let (controller_tx, controller_rx) = mpsc::channel(CONTROLLER_QUEUE_SIZE);
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let (controller, controller_inbound) = Terminal::spawn(TerminalSpawn {
            id: CONTROLLER_FLOW_ID,
            crane_name: hub.to_string(),
            sink: OutboundSink::Controller(controller_tx.clone()),
            scheduler: scheduler.clone(),
            parent_cancel: cancel.clone(),
            reaper: None,
            opts: TerminalOpts::default(),
            remote: false,
            idle_timeout: None,
            initial_state: TerminalState::Live,
        });

        let crane = Arc::new(Self {
            public: AtomicBool::new(opts.public),
            hub,
            opts,
            net_state: NetState::new(),
            scheduler,
            terminals: StdMutex::new(HashMap::new()),
            next_flow_id: StdMutex::new(CONTROLLER_FLOW_ID),
            controller: Arc::clone(&controller),
            controller_tx,
            terminal_msgs: Arc::new(Mailbox::new(TERMINAL_QUEUE_SIZE)),
            reaper_tx,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            cancel,
            stopped: AtomicBool::new(false),
            next_op_id: AtomicU64::new(1),
            pending_ops: StdMutex::new(HashMap::new()),
            gossip_source: StdMutex::new(None),
        });

        crane.terminals.lock().expect("flow table lock poisoned").insert(
            CONTROLLER_FLOW_ID,
            FlowEntry {
                terminal: controller,
                inbound_tx: controller_inbound,
            },
        );
        metrics::gauge!(TERMINALS_ACTIVE).increment(1.0);

        tokio::spawn(Arc::clone(&crane).read_loop(read_half, reaper_rx));
        tokio::spawn(Arc::clone(&crane).write_loop(write_half, controller_rx));
        tokio::spawn(Arc::clone(&crane).controller_loop());

        debug!(crane = %crane.hub, mine = crane.opts.mine, "crane started");
        crane
    }

    pub fn connected_hub(&self) -> &Hub {
        &self.hub
    }

    pub fn is_mine(&self) -> bool {
        self.opts.mine
    }

    pub fn is_public(&self) -> bool {
        self.public.load(Ordering::Acquire)
    }

    /// Promote the crane to public lane duty.
    pub fn make_public(&self) {
        self.public.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.net_state.is_stopping()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Clear a retirement mark that has not executed yet. True when the
    /// crane was indeed marked.
    pub fn abort_stopping(&self) -> bool {
        self.net_state.abort_stopping()
    }

    /// Mark the crane for retirement. True when this call set the mark.
    pub fn mark_stopping(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.net_state.mark_stopping()
    }

    pub fn controller(&self) -> &Arc<Terminal> {
        &self.controller
    }

    /// The live terminal for a flow, if any.
    pub fn terminal(&self, flow_id: u32) -> Option<Arc<Terminal>> {
        self.terminals
            .lock()
            .expect("flow table lock poisoned")
            .get(&flow_id)
            .map(|e| Arc::clone(&e.terminal))
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals
            .lock()
            .expect("flow table lock poisoned")
            .len()
    }

    /// The next terminal the remote side established on this crane.
    pub async fn next_incoming(&self) -> Option<Arc<Terminal>> {
        self.incoming_rx.lock().await.recv().await
    }

    /// Provide the hub announcements used to answer gossip queries.
    pub fn set_gossip_source(&self, source: Arc<dyn GossipSource>) {
        *self
            .gossip_source
            .lock()
            .expect("gossip source lock poisoned") = Some(source);
    }

    /// Establish a locally initiated terminal: allocate a flow id, register
    /// the terminal, and push the Init message onto the prioritised
    /// controller channel. Fails with `Stopping` when the crane goes down
    /// before the Init is on its way.
    pub async fn establish_new_terminal(
        self: &Arc<Self>,
        opts: TerminalOpts,
    ) -> Result<Arc<Terminal>, FlowError> {
        if self.is_stopped() || self.cancel.is_cancelled() {
            return Err(FlowError::stopping().wrap("crane is down"));
        }

        let init_data = serde_json::to_vec(&opts)
            .map_err(|e| FlowError::internal(format!("failed to encode init params: {e}")))?;

        let (terminal, flow_id) = self.register_local_terminal(opts);

        let mut msg = Msg::empty(&self.scheduler).await;
        msg.flow_id = flow_id;
        msg.kind = MsgKind::Init;
        msg.payload = crate::payload::Payload::new(init_data);

        tokio::select! {
            sent = self.controller_tx.send(msg) => {
                if sent.is_err() {
                    self.abandon_terminal(flow_id, FlowError::stopping().wrap("initiation aborted"));
                    return Err(FlowError::stopping());
                }
            }
            _ = self.cancel.cancelled() => {
                self.abandon_terminal(flow_id, FlowError::stopping().wrap("initiation aborted"));
                return Err(FlowError::stopping());
            }
        }

        debug!(crane = %self.hub, flow = flow_id, "initiated new terminal");
        Ok(terminal)
    }

    /// Remove a terminal from the flow table and tear it down. The flow id
    /// becomes reusable once the terminal is fully abandoned.
    pub fn abandon_terminal(&self, flow_id: u32, err: FlowError) {
        if flow_id == CONTROLLER_FLOW_ID {
            return;
        }
        let entry = self
            .terminals
            .lock()
            .expect("flow table lock poisoned")
            .remove(&flow_id);
        if let Some(entry) = entry {
            debug!(crane = %self.hub, flow = flow_id, error = %err, "abandoning terminal");
            metrics::gauge!(TERMINALS_ACTIVE).decrement(1.0);
            entry.terminal.end_with(err, true);
        }
    }

    /// Tear the whole crane down: cancel both loops, close the outbound
    /// queue and end every terminal with `err` (default `Stopping`).
    pub fn stop(&self, err: Option<FlowError>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let err = err.unwrap_or_else(FlowError::stopping);
        info!(crane = %self.hub, error = %err, "crane stopping");

        self.cancel.cancel();
        self.terminal_msgs.close();
        self.pending_ops
            .lock()
            .expect("pending ops lock poisoned")
            .clear();

        let entries: Vec<FlowEntry> = {
            let mut terminals = self.terminals.lock().expect("flow table lock poisoned");
            terminals.drain().map(|(_, e)| e).collect()
        };
        metrics::gauge!(TERMINALS_ACTIVE).decrement(entries.len() as f64);
        for entry in entries {
            entry.terminal.end_with(err.clone(), false);
        }
    }

    /// Start a gossip query on the controller.
    pub async fn query_gossip(self: &Arc<Self>) -> Result<GossipQueryOp, FlowError> {
        let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_ops
            .lock()
            .expect("pending ops lock poisoned")
            .insert(id, tx);

        if let Err(err) = self.send_controller_op(&ControllerOp::GossipQuery { id }).await {
            self.pending_ops
                .lock()
                .expect("pending ops lock poisoned")
                .remove(&id);
            return Err(err);
        }
        Ok(GossipQueryOp { done: rx })
    }

    async fn send_controller_op(self: &Arc<Self>, op: &ControllerOp) -> Result<(), FlowError> {
        let data = op
            .to_json()
            .map_err(|e| FlowError::internal(format!("failed to encode controller op: {e}")))?;
        let msg = Msg::new(&self.scheduler, data).await;
        self.controller.send(msg).await
    }

    fn register_local_terminal(self: &Arc<Self>, opts: TerminalOpts) -> (Arc<Terminal>, u32) {
        let mut terminals = self.terminals.lock().expect("flow table lock poisoned");
        let flow_id = {
            let mut next = self.next_flow_id.lock().expect("flow id lock poisoned");
            let mut candidate = next.wrapping_add(1);
            // Ids are reused only once the previous holder left the table,
            // i.e. after it was fully abandoned.
            while candidate == CONTROLLER_FLOW_ID || terminals.contains_key(&candidate) {
                candidate = candidate.wrapping_add(1);
            }
            *next = candidate;
            candidate
        };

        let (terminal, inbound_tx) = Terminal::spawn(TerminalSpawn {
            id: flow_id,
            crane_name: self.hub.to_string(),
            sink: OutboundSink::Shared(Arc::clone(&self.terminal_msgs)),
            scheduler: self.scheduler.clone(),
            parent_cancel: self.cancel.clone(),
            reaper: Some(self.reaper_tx.clone()),
            opts,
            remote: false,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            initial_state: TerminalState::Initialising,
        });

        terminals.insert(
            flow_id,
            FlowEntry {
                terminal: Arc::clone(&terminal),
                inbound_tx,
            },
        );
        metrics::gauge!(TERMINALS_ACTIVE).increment(1.0);
        (terminal, flow_id)
    }

    /// Handle an Init for an unknown flow id: build the remote terminal,
    /// Live immediately. A failure is answered with a Stop carrying the
    /// packed error; that push must never block the reader, so it goes
    /// through the displacing path.
    async fn establish_terminal(self: &Arc<Self>, frame: Frame) {
        let flow_id = frame.flow_id;
        let result = (|| {
            if flow_id == CONTROLLER_FLOW_ID {
                return Err(FlowError::with(
                    FlowErrorKind::UnexpectedMsg,
                    "flow id 0 is reserved for the controller",
                ));
            }
            let opts: TerminalOpts = serde_json::from_slice(&frame.payload)
                .map_err(|e| FlowError::internal(format!("bad init params: {e}")))?;
            self.register_remote_at(flow_id, opts)
        })();

        match result {
            Ok(terminal) => {
                debug!(crane = %self.hub, flow = flow_id, "established remote terminal");
                let _ = self.incoming_tx.send(terminal);
            }
            Err(err) => {
                warn!(crane = %self.hub, flow = flow_id, error = %err, "failed to establish remote terminal");
                let stop = Msg::stop(&self.scheduler, flow_id, &err);
                self.terminal_msgs.push_displacing(stop);
            }
        }
    }

    fn register_remote_at(
        self: &Arc<Self>,
        flow_id: u32,
        opts: TerminalOpts,
    ) -> Result<Arc<Terminal>, FlowError> {
        let mut terminals = self.terminals.lock().expect("flow table lock poisoned");
        if terminals.contains_key(&flow_id) {
            return Err(FlowError::with(
                FlowErrorKind::UnexpectedMsg,
                "flow id already in use",
            ));
        }
        let idle = if self.is_public() {
            Some(PUBLIC_REMOTE_IDLE_TIMEOUT)
        } else {
            Some(DEFAULT_IDLE_TIMEOUT)
        };
        let (terminal, inbound_tx) = Terminal::spawn(TerminalSpawn {
            id: flow_id,
            crane_name: self.hub.to_string(),
            sink: OutboundSink::Shared(Arc::clone(&self.terminal_msgs)),
            scheduler: self.scheduler.clone(),
            parent_cancel: self.cancel.clone(),
            reaper: Some(self.reaper_tx.clone()),
            opts,
            remote: true,
            idle_timeout: idle,
            initial_state: TerminalState::Live,
        });
        terminals.insert(
            flow_id,
            FlowEntry {
                terminal: Arc::clone(&terminal),
                inbound_tx,
            },
        );
        metrics::gauge!(TERMINALS_ACTIVE).increment(1.0);
        Ok(terminal)
    }

    fn prune_terminal(&self, flow_id: u32) {
        let mut terminals = self.terminals.lock().expect("flow table lock poisoned");
        if let Some(entry) = terminals.get(&flow_id) {
            if entry.terminal.state() == TerminalState::Abandoned {
                terminals.remove(&flow_id);
                metrics::gauge!(TERMINALS_ACTIVE).decrement(1.0);
                debug!(crane = %self.hub, flow = flow_id, "pruned abandoned terminal");
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        read_half: tokio::io::ReadHalf<Box<dyn CraneTransport>>,
        mut reaper_rx: mpsc::UnboundedReceiver<u32>,
    ) {
        let mut framed = FramedRead::new(read_half, CraneCodec::default());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(flow_id) = reaper_rx.recv() => self.prune_terminal(flow_id),

                next = framed.next() => match next {
                    Some(Ok(frame)) => self.dispatch_frame(frame).await,
                    Some(Err(e)) => {
                        warn!(crane = %self.hub, error = %e, "crane read failed");
                        self.stop(Some(FlowError::connection(e.to_string())));
                        break;
                    }
                    None => {
                        debug!(crane = %self.hub, "crane connection closed by peer");
                        self.stop(Some(FlowError::connection("closed by peer")));
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch_frame(self: &Arc<Self>, frame: Frame) {
        metrics::counter!(CRANE_FRAMES_IN).increment(1);
        metrics::counter!(CRANE_BYTES_IN).increment(frame.payload.len() as u64);

        let inbound = self
            .terminals
            .lock()
            .expect("flow table lock poisoned")
            .get(&frame.flow_id)
            .map(|e| e.inbound_tx.clone());

        match inbound {
            Some(tx) => {
                let flow_id = frame.flow_id;
                let msg = Msg::from_frame(&self.scheduler, frame).await;
                if tx.send(msg).await.is_err() {
                    // The dispatch task is gone; the reaper will prune it.
                    debug!(crane = %self.hub, flow = flow_id, "dropping frame for ended terminal");
                }
            }
            None if frame.kind == MsgKind::Init => self.establish_terminal(frame).await,
            None => {
                debug!(
                    crane = %self.hub,
                    flow = frame.flow_id,
                    kind = ?frame.kind,
                    "dropping frame for unknown flow"
                );
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write_half: tokio::io::WriteHalf<Box<dyn CraneTransport>>,
        mut controller_rx: mpsc::Receiver<Msg>,
    ) {
        loop {
            // Controller traffic first on every iteration.
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(msg) = controller_rx.recv() => msg,
                maybe = self.terminal_msgs.recv() => match maybe {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let mut shipment = msg;
            shipment.pack();

            // Coalesce whatever else is ready, controller channel first.
            let mut batched = 1;
            while batched < MAX_SHIPMENT_MSGS && shipment.payload.len() < MAX_SHIPMENT_SIZE {
                if let Ok(extra) = controller_rx.try_recv() {
                    shipment.consume(extra);
                    batched += 1;
                    continue;
                }
                match self.terminal_msgs.try_recv() {
                    Some(extra) => {
                        shipment.consume(extra);
                        batched += 1;
                    }
                    None => break,
                }
            }

            let mut buf = BytesMut::with_capacity(shipment.payload.len());
            shipment.payload.write_to(&mut buf);

            let write = async {
                write_half.write_all(&buf).await?;
                write_half.flush().await
            };
            match write.await {
                Ok(()) => {
                    metrics::counter!(CRANE_FRAMES_OUT).increment(batched as u64);
                    metrics::counter!(CRANE_BYTES_OUT).increment(buf.len() as u64);
                    shipment.finish_unit();
                }
                Err(e) => {
                    warn!(crane = %self.hub, error = %e, "crane write failed");
                    shipment.finish_unit();
                    self.stop(Some(FlowError::connection(e.to_string())));
                    break;
                }
            }
        }
    }

    /// Answers controller requests and completes pending operations.
    async fn controller_loop(self: Arc<Self>) {
        loop {
            let mut msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = self.controller.recv() => match maybe {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let data = std::mem::take(&mut msg.payload).into_bytes();
            msg.finish_unit();

            let op = match ControllerOp::from_json(&data) {
                Ok(op) => op,
                Err(e) => {
                    warn!(crane = %self.hub, error = %e, "undecodable controller message");
                    continue;
                }
            };

            match op {
                ControllerOp::GossipQuery { id } => {
                    let hubs = self
                        .gossip_source
                        .lock()
                        .expect("gossip source lock poisoned")
                        .as_ref()
                        .map(|s| s.announced_hubs())
                        .unwrap_or_default();
                    let reply = ControllerOp::GossipHubs { id, hubs };
                    if let Err(e) = self.send_controller_op(&reply).await {
                        debug!(crane = %self.hub, error = %e, "failed to answer gossip query");
                    }
                }
                ControllerOp::GossipHubs { id, hubs } => {
                    let pending = self
                        .pending_ops
                        .lock()
                        .expect("pending ops lock poisoned")
                        .remove(&id);
                    match pending {
                        Some(tx) => {
                            let _ = tx.send(Ok(hubs));
                        }
                        None => {
                            debug!(crane = %self.hub, op = id, "gossip reply for unknown op");
                        }
                    }
                }
                ControllerOp::OpError { id, message } => {
                    let pending = self
                        .pending_ops
                        .lock()
                        .expect("pending ops lock poisoned")
                        .remove(&id);
                    if let Some(tx) = pending {
                        let _ = tx.send(Err(FlowError::with(FlowErrorKind::Remote(0), message)));
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Crane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crane")
            .field("hub", &self.hub.id)
            .field("mine", &self.opts.mine)
            .field("public", &self.is_public())
            .field("stopping", &self.is_stopping())
            .field("stopped", &self.is_stopped())
            .field("terminals", &self.terminal_count())
            .finish()
    }
}
