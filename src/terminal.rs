//! Terminals — per-flow endpoints inside a crane.
//!
//! A terminal owns one flow id on its crane and moves through
//! `Initialising → Live → Stopping → Abandoned`. Locally created terminals
//! start Initialising and become Live when the peer first speaks on the
//! flow; remotely created ones are Live from the start. Every terminal runs
//! one dispatch task that forwards inbound messages, interprets Stop frames
//! and enforces the idle deadline.
//!
//! Terminals hold only the crane's outbound queue handle and a child
//! cancellation token — no reference back to the crane itself — so a
//! terminal can always tear down even when its crane is already gone.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FlowError;
use crate::mailbox::Mailbox;
use crate::msg::{Msg, MsgKind};
use crate::unit::Scheduler;

/// Idle timeout for ordinary terminals.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Idle timeout for remote terminals on public cranes, which legitimately
/// sit quiet for longer.
pub const PUBLIC_REMOTE_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const DEFAULT_QUEUE_SIZE: usize = 64;

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_version() -> u8 {
    1
}

/// Init parameters carried in the Init frame. The format must stay stable
/// across both sides of a crane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalOpts {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Free-form label of what this flow is for, for logs only.
    #[serde(default)]
    pub usage: Option<String>,
    #[serde(default = "default_version")]
    pub version: u8,
}

impl Default for TerminalOpts {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            usage: None,
            version: 1,
        }
    }
}

/// Terminal lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminalState {
    Initialising = 0,
    Live = 1,
    Stopping = 2,
    Abandoned = 3,
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: TerminalState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> TerminalState {
        match self.0.load(Ordering::Acquire) {
            0 => TerminalState::Initialising,
            1 => TerminalState::Live,
            2 => TerminalState::Stopping,
            _ => TerminalState::Abandoned,
        }
    }

    fn transition(&self, from: TerminalState, to: TerminalState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set Abandoned, returning the previous state.
    fn abandon(&self) -> TerminalState {
        match self.0.swap(TerminalState::Abandoned as u8, Ordering::AcqRel) {
            0 => TerminalState::Initialising,
            1 => TerminalState::Live,
            2 => TerminalState::Stopping,
            _ => TerminalState::Abandoned,
        }
    }
}

/// Where a terminal's outbound messages go: the crane's shared terminal
/// queue, or the prioritised controller channel for flow 0.
#[derive(Debug)]
pub(crate) enum OutboundSink {
    Shared(Arc<Mailbox>),
    Controller(mpsc::Sender<Msg>),
}

impl OutboundSink {
    async fn send(&self, msg: Msg) -> Result<(), FlowError> {
        match self {
            Self::Shared(mailbox) => mailbox.send(msg).await,
            Self::Controller(tx) => tx.send(msg).await.map_err(|e| {
                let mut msg = e.0;
                msg.finish_unit();
                FlowError::stopping().wrap("controller channel closed")
            }),
        }
    }

    fn push_displacing(&self, msg: Msg) {
        match self {
            Self::Shared(mailbox) => mailbox.push_displacing(msg),
            Self::Controller(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    let mut msg = match e {
                        mpsc::error::TrySendError::Full(m)
                        | mpsc::error::TrySendError::Closed(m) => m,
                    };
                    warn!(flow = msg.flow_id, "controller channel unavailable, dropping message");
                    msg.finish_unit();
                }
            }
        }
    }
}

/// Everything a crane passes in when spawning a terminal.
pub(crate) struct TerminalSpawn {
    pub id: u32,
    pub crane_name: String,
    pub sink: OutboundSink,
    pub scheduler: Scheduler,
    pub parent_cancel: CancellationToken,
    /// Tells the crane to drop this flow id from its table after teardown.
    pub reaper: Option<mpsc::UnboundedSender<u32>>,
    pub opts: TerminalOpts,
    pub remote: bool,
    pub idle_timeout: Option<Duration>,
    pub initial_state: TerminalState,
}

/// A single flow endpoint. See the module docs.
#[derive(Debug)]
pub struct Terminal {
    id: u32,
    crane_name: String,
    remote: bool,
    state: StateCell,
    idle_timeout: StdMutex<Option<Duration>>,
    last_activity: StdMutex<Instant>,
    outbound: OutboundSink,
    cancel: CancellationToken,
    delivered: tokio::sync::Mutex<mpsc::Receiver<Msg>>,
    ended_tx: watch::Sender<Option<FlowError>>,
    scheduler: Scheduler,
}

impl Terminal {
    /// Build the terminal and spawn its dispatch task. Returns the terminal
    /// and the sender the crane pushes inbound messages into.
    pub(crate) fn spawn(spawn: TerminalSpawn) -> (Arc<Terminal>, mpsc::Sender<Msg>) {
        let queue = spawn.opts.queue_size.max(1);
        let (raw_tx, raw_rx) = mpsc::channel(queue);
        let (delivered_tx, delivered_rx) = mpsc::channel(queue);
        let (ended_tx, _) = watch::channel(None);

        let terminal = Arc::new(Terminal {
            id: spawn.id,
            crane_name: spawn.crane_name,
            remote: spawn.remote,
            state: StateCell::new(spawn.initial_state),
            idle_timeout: StdMutex::new(spawn.idle_timeout),
            last_activity: StdMutex::new(Instant::now()),
            outbound: spawn.sink,
            cancel: spawn.parent_cancel.child_token(),
            delivered: tokio::sync::Mutex::new(delivered_rx),
            ended_tx,
            scheduler: spawn.scheduler,
        });

        tokio::spawn(Arc::clone(&terminal).dispatch(raw_rx, delivered_tx, spawn.reaper));

        (terminal, raw_tx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> TerminalState {
        self.state.get()
    }

    pub fn is_live(&self) -> bool {
        self.state.get() == TerminalState::Live
    }

    /// Whether this terminal was created by the remote side.
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Change the idle timeout. Takes effect on the next deadline check.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.idle_timeout.lock().expect("idle timeout lock poisoned") = Some(timeout);
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        *self.idle_timeout.lock().expect("idle timeout lock poisoned")
    }

    /// Send a message on this flow. The flow id is stamped here. Blocks
    /// while the crane's outbound queue is full — that is the backpressure
    /// signal.
    pub async fn send(&self, mut msg: Msg) -> Result<(), FlowError> {
        if self.state.get() == TerminalState::Abandoned {
            msg.finish_unit();
            return Err(FlowError::stopping().wrap("terminal has ended"));
        }
        msg.flow_id = self.id;
        self.touch();
        self.outbound.send(msg).await
    }

    /// Convenience: wrap `data` in a Data message and send it.
    pub async fn send_data(&self, data: impl Into<Bytes>) -> Result<(), FlowError> {
        let msg = Msg::new(&self.scheduler, data).await;
        self.send(msg).await
    }

    /// Receive the next inbound message. `None` once the terminal has
    /// ended and the queue is drained. The caller finishes the message's
    /// unit when done with it.
    pub async fn recv(&self) -> Option<Msg> {
        self.delivered.lock().await.recv().await
    }

    /// Wait for the terminal to end. The returned error is the final word:
    /// [`FlowError::is_ok`] distinguishes acknowledged termination from
    /// failure.
    pub async fn ended(&self) -> FlowError {
        let mut rx = self.ended_tx.subscribe();
        loop {
            let current = rx.borrow().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                return FlowError::stopping();
            }
        }
    }

    /// The final error, if the terminal has already ended.
    pub fn try_ended(&self) -> Option<FlowError> {
        self.ended_tx.borrow().clone()
    }

    /// Mark this terminal as scheduled for teardown.
    pub fn mark_stopping(&self) -> bool {
        self.state
            .transition(TerminalState::Live, TerminalState::Stopping)
    }

    /// Clear a stopping mark that has not been executed yet. Used by
    /// optimisation to resurrect a terminal it wants to keep after all.
    pub fn abort_stopping(&self) -> bool {
        self.state
            .transition(TerminalState::Stopping, TerminalState::Live)
    }

    /// Tear the terminal down: best-effort Stop to the peer (when
    /// `notify_peer`), state to Abandoned, `ended` closed with `err`.
    /// Messages already queued outbound still go out ahead of the Stop.
    /// Idempotent: only the first call takes effect.
    pub(crate) fn end_with(&self, err: FlowError, notify_peer: bool) {
        if self.state.abandon() == TerminalState::Abandoned {
            return;
        }
        debug!(
            crane = %self.crane_name,
            flow = self.id,
            error = %err,
            "terminal ended"
        );
        if notify_peer {
            let stop = Msg::stop(&self.scheduler, self.id, &err);
            self.outbound.push_displacing(stop);
        }
        self.ended_tx.send_replace(Some(err));
        self.cancel.cancel();
    }

    /// Public teardown entry point: end this terminal with `err` and tell
    /// the peer.
    pub fn abandon(&self, err: FlowError) {
        self.end_with(err, true);
    }

    pub(crate) fn acknowledge(&self) {
        if self
            .state
            .transition(TerminalState::Initialising, TerminalState::Live)
        {
            debug!(crane = %self.crane_name, flow = self.id, "terminal acknowledged by peer");
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn idle_deadline(&self) -> Instant {
        let last = *self.last_activity.lock().expect("activity lock poisoned");
        match self.idle_timeout() {
            Some(timeout) => last + timeout,
            // Effectively never; the controller terminal does not idle out.
            None => Instant::now() + Duration::from_secs(365 * 24 * 3600),
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        mut raw_rx: mpsc::Receiver<Msg>,
        delivered_tx: mpsc::Sender<Msg>,
        reaper: Option<mpsc::UnboundedSender<u32>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.end_with(FlowError::stopping(), false);
                    break;
                }

                _ = tokio::time::sleep_until(self.idle_deadline()) => {
                    // Activity may have refreshed the deadline while we slept.
                    if self.idle_deadline() > Instant::now() {
                        continue;
                    }
                    debug!(crane = %self.crane_name, flow = self.id, "terminal idled out");
                    self.end_with(FlowError::idle_timeout(), true);
                    break;
                }

                inbound = raw_rx.recv() => {
                    let Some(mut msg) = inbound else {
                        self.end_with(FlowError::stopping(), false);
                        break;
                    };
                    self.touch();
                    self.acknowledge();
                    match msg.kind {
                        MsgKind::Stop => {
                            let data = std::mem::take(&mut msg.payload).into_bytes();
                            msg.finish_unit();
                            self.end_with(FlowError::unpack(&data), false);
                            break;
                        }
                        MsgKind::Data | MsgKind::Init => {
                            if delivered_tx.send(msg).await.is_err() {
                                self.end_with(
                                    FlowError::stopping().wrap("message receiver dropped"),
                                    true,
                                );
                                break;
                            }
                        }
                        MsgKind::Unknown(byte) => {
                            warn!(
                                crane = %self.crane_name,
                                flow = self.id,
                                kind = byte,
                                "dropping message of unknown kind"
                            );
                            msg.finish_unit();
                        }
                    }
                }
            }
        }

        if let Some(reaper) = reaper {
            let _ = reaper.send(self.id);
        }
    }
}
