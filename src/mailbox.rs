//! Bounded outbound mailbox shared by a crane's terminals.
//!
//! Data sends block while the mailbox is full — a full queue IS the
//! backpressure signal to the producing flow. Stop messages must never
//! block or be lost behind a stuck queue, so they go through
//! [`Mailbox::push_displacing`], which makes room by dropping the oldest
//! queued message (its unit is finished, the bytes are abandoned).
//!
//! Receiving prefers the earliest high-priority message; within each
//! priority class FIFO order is kept.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use crate::error::FlowError;
use crate::msg::Msg;

#[derive(Debug)]
struct State {
    queue: VecDeque<Msg>,
    closed: bool,
}

/// See the module docs.
#[derive(Debug)]
pub struct Mailbox {
    state: Mutex<State>,
    capacity: usize,
    /// Signalled when a slot frees up.
    space: Notify,
    /// Signalled when a message arrives.
    items: Notify,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "mailbox capacity must be positive");
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Enqueue, waiting for space while full. Returns `Stopping` after
    /// [`Mailbox::close`]; the message's unit is finished before returning
    /// the error.
    pub async fn send(&self, mut msg: Msg) -> Result<(), FlowError> {
        loop {
            {
                let mut state = self.state.lock().expect("mailbox lock poisoned");
                if state.closed {
                    drop(state);
                    msg.finish_unit();
                    return Err(FlowError::stopping().wrap("mailbox closed"));
                }
                if state.queue.len() < self.capacity {
                    state.queue.push_back(msg);
                    drop(state);
                    self.items.notify_one();
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    /// Enqueue without ever waiting. While full, the oldest queued message
    /// is displaced to make room. Used for Stop messages, which must go out
    /// even when the queue is wedged.
    pub fn push_displacing(&self, mut msg: Msg) {
        {
            let mut state = self.state.lock().expect("mailbox lock poisoned");
            if state.closed {
                drop(state);
                msg.finish_unit();
                return;
            }
            if state.queue.len() >= self.capacity {
                if let Some(mut displaced) = state.queue.pop_front() {
                    warn!(
                        flow = displaced.flow_id,
                        "mailbox full, displacing oldest message"
                    );
                    displaced.finish_unit();
                }
            }
            state.queue.push_back(msg);
        }
        self.items.notify_one();
    }

    /// Dequeue the earliest high-priority message, or the front of the
    /// queue. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<Msg> {
        loop {
            {
                let mut state = self.state.lock().expect("mailbox lock poisoned");
                if let Some(index) = Self::pick(&state.queue) {
                    let msg = state.queue.remove(index);
                    drop(state);
                    self.space.notify_one();
                    return msg;
                }
                if state.closed {
                    return None;
                }
            }
            self.items.notified().await;
        }
    }

    /// Dequeue immediately, or `None` when the mailbox is currently empty.
    pub fn try_recv(&self) -> Option<Msg> {
        let mut state = self.state.lock().expect("mailbox lock poisoned");
        let index = Self::pick(&state.queue)?;
        let msg = state.queue.remove(index);
        drop(state);
        self.space.notify_one();
        msg
    }

    fn pick(queue: &VecDeque<Msg>) -> Option<usize> {
        if queue.is_empty() {
            return None;
        }
        Some(
            queue
                .iter()
                .position(Msg::is_high_priority)
                .unwrap_or(0),
        )
    }

    /// Close the mailbox and finish the units of everything still queued.
    /// Blocked senders and receivers are woken.
    pub fn close(&self) {
        let drained: Vec<Msg> = {
            let mut state = self.state.lock().expect("mailbox lock poisoned");
            state.closed = true;
            state.queue.drain(..).collect()
        };
        for mut msg in drained {
            msg.finish_unit();
        }
        self.space.notify_waiters();
        self.items.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("mailbox lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Scheduler;
    use std::sync::Arc;
    use std::time::Duration;

    async fn msg(sched: &Scheduler, flow_id: u32) -> Msg {
        let mut m = Msg::empty(sched).await;
        m.flow_id = flow_id;
        m
    }

    #[tokio::test]
    async fn fifo_within_normal_priority() {
        let sched = Scheduler::default();
        let mbox = Mailbox::new(8);
        mbox.send(msg(&sched, 1).await).await.unwrap();
        mbox.send(msg(&sched, 2).await).await.unwrap();
        mbox.send(msg(&sched, 3).await).await.unwrap();

        assert_eq!(mbox.recv().await.unwrap().flow_id, 1);
        assert_eq!(mbox.recv().await.unwrap().flow_id, 2);
        assert_eq!(mbox.recv().await.unwrap().flow_id, 3);
    }

    #[tokio::test]
    async fn high_priority_is_picked_first() {
        let sched = Scheduler::default();
        let mbox = Mailbox::new(8);
        mbox.send(msg(&sched, 1).await).await.unwrap();
        let mut urgent = msg(&sched, 2).await;
        urgent.make_high_priority();
        mbox.send(urgent).await.unwrap();
        mbox.send(msg(&sched, 3).await).await.unwrap();

        assert_eq!(mbox.recv().await.unwrap().flow_id, 2);
        assert_eq!(mbox.recv().await.unwrap().flow_id, 1);
        assert_eq!(mbox.recv().await.unwrap().flow_id, 3);
    }

    #[tokio::test]
    async fn full_mailbox_blocks_sender_until_recv() {
        let sched = Scheduler::default();
        let mbox = Arc::new(Mailbox::new(1));
        mbox.send(msg(&sched, 1).await).await.unwrap();

        let sender = {
            let mbox = Arc::clone(&mbox);
            let blocked = msg(&sched, 2).await;
            tokio::spawn(async move { mbox.send(blocked).await })
        };

        // The sender cannot finish while the mailbox is full.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        assert_eq!(mbox.recv().await.unwrap().flow_id, 1);
        sender.await.unwrap().unwrap();
        assert_eq!(mbox.recv().await.unwrap().flow_id, 2);
    }

    #[tokio::test]
    async fn push_displacing_drops_oldest_and_finishes_its_unit() {
        let sched = Scheduler::default();
        let mbox = Mailbox::new(2);
        mbox.send(msg(&sched, 1).await).await.unwrap();
        mbox.send(msg(&sched, 2).await).await.unwrap();
        assert_eq!(sched.outstanding(), 2);

        mbox.push_displacing(msg(&sched, 3).await);
        // Message 1 displaced, its unit finished.
        assert_eq!(sched.outstanding(), 2);
        assert_eq!(mbox.recv().await.unwrap().flow_id, 2);
        assert_eq!(mbox.recv().await.unwrap().flow_id, 3);
    }

    #[tokio::test]
    async fn close_wakes_blocked_sender_with_stopping() {
        let sched = Scheduler::default();
        let mbox = Arc::new(Mailbox::new(1));
        mbox.send(msg(&sched, 1).await).await.unwrap();

        let sender = {
            let mbox = Arc::clone(&mbox);
            let blocked = msg(&sched, 2).await;
            tokio::spawn(async move { mbox.send(blocked).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        mbox.close();
        let err = sender.await.unwrap().unwrap_err();
        assert!(err.is(crate::error::FlowErrorKind::Stopping));
        // Close drained the queued message and the blocked one was finished.
        assert_eq!(sched.outstanding(), 0);
    }

    #[tokio::test]
    async fn recv_returns_none_after_close_and_drain() {
        let sched = Scheduler::default();
        let mbox = Mailbox::new(4);
        mbox.send(msg(&sched, 1).await).await.unwrap();
        mbox.close();
        // close() finishes queued units; nothing is left to receive.
        assert!(mbox.recv().await.is_none());
        assert_eq!(sched.outstanding(), 0);
    }
}
