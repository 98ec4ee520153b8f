//! Typed messages flowing through cranes.
//!
//! A [`Msg`] binds a flow id, a kind, a segmented payload and the [`Unit`]
//! that accounts for its processing. The unit holder is an `Option`: a
//! message whose unit was already handed off finishes as a no-op, so
//! [`Msg::finish_unit`] is safe to call on any teardown path.

use bytes::Bytes;

use crate::codec::{put_varint, Frame};
use crate::payload::Payload;
use crate::unit::{Scheduler, Unit};

/// Wire message kinds. Unlisted bytes decode to `Unknown` and are dropped
/// by the crane dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Establish a new flow; payload carries the terminal's init parameters.
    Init,
    /// User bytes.
    Data,
    /// Terminate a flow; payload carries a packed [`FlowError`](crate::error::FlowError).
    Stop,
    Unknown(u8),
}

impl MsgKind {
    pub fn wire(self) -> u8 {
        match self {
            Self::Init => 1,
            Self::Data => 2,
            Self::Stop => 3,
            Self::Unknown(byte) => byte,
        }
    }

    pub fn from_wire(byte: u8) -> Self {
        match byte {
            1 => Self::Init,
            2 => Self::Data,
            3 => Self::Stop,
            other => Self::Unknown(other),
        }
    }
}

/// A message within the relay fabric.
#[derive(Debug)]
pub struct Msg {
    pub flow_id: u32,
    pub kind: MsgKind,
    pub payload: Payload,
    unit: Option<Unit>,
}

impl Msg {
    /// New Data message with a fresh unit. The flow id is unset.
    pub async fn new(scheduler: &Scheduler, data: impl Into<Bytes>) -> Self {
        Self {
            flow_id: 0,
            kind: MsgKind::Data,
            payload: Payload::new(data),
            unit: Some(scheduler.new_unit().await),
        }
    }

    /// New empty Data message with a fresh unit.
    pub async fn empty(scheduler: &Scheduler) -> Self {
        Self {
            flow_id: 0,
            kind: MsgKind::Data,
            payload: Payload::empty(),
            unit: Some(scheduler.new_unit().await),
        }
    }

    /// Admit a decoded inbound frame. Ingress work is unit-scheduled the
    /// same way egress is, so read pressure throttles the reader too.
    pub async fn from_frame(scheduler: &Scheduler, frame: Frame) -> Self {
        Self {
            flow_id: frame.flow_id,
            kind: frame.kind,
            payload: Payload::new(frame.payload),
            unit: Some(scheduler.new_unit().await),
        }
    }

    /// Build a Stop message carrying a packed error. Control messages skip
    /// the admission slowdown: teardown must not be throttled by the very
    /// pressure it resolves.
    pub fn stop(scheduler: &Scheduler, flow_id: u32, err: &crate::error::FlowError) -> Self {
        Self {
            flow_id,
            kind: MsgKind::Stop,
            payload: Payload::new(err.pack()),
            unit: Some(scheduler.new_unit_now()),
        }
    }

    pub fn is_high_priority(&self) -> bool {
        self.unit.as_ref().is_some_and(Unit::is_high_priority)
    }

    pub fn make_high_priority(&mut self) {
        if let Some(unit) = self.unit.as_mut() {
            unit.make_high_priority();
        }
    }

    /// Record this message's origin for unit leak diagnostics. No-op when
    /// the unit was already handed off.
    pub fn debug_unit(&self, source: impl Into<String>) {
        if let Some(unit) = self.unit.as_ref() {
            unit.debug(source);
        }
    }

    /// Prepend the wire header in place: `[flow id BE | kind]`, then the
    /// varint length of everything that follows it. Must be called exactly
    /// once, immediately before the bytes go out.
    pub fn pack(&mut self) {
        let mut header = Vec::with_capacity(5);
        header.extend_from_slice(&self.flow_id.to_be_bytes());
        header.push(self.kind.wire());
        self.payload.prepend(header);

        let mut length = Vec::with_capacity(5);
        put_varint(&mut length, self.payload.len() as u32);
        self.payload.prepend(length);
    }

    /// Pack `other` and append its bytes to this message's payload, so both
    /// leave in one crane write. The data is moved, not copied. A
    /// high-priority mark is inherited, and `other`'s unit is finished.
    pub fn consume(&mut self, mut other: Msg) {
        other.pack();
        self.payload.append(std::mem::take(&mut other.payload));
        if other.is_high_priority() {
            self.make_high_priority();
        }
        other.finish_unit();
    }

    /// Signal the scheduler that this message's processing is complete.
    /// Safe to call when the unit holder is already empty.
    pub fn finish_unit(&mut self) {
        if let Some(unit) = self.unit.take() {
            unit.finish();
        }
    }
}
