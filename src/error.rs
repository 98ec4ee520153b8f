//! Flow errors — the error values terminals and cranes exchange and report.
//!
//! A [`FlowError`] carries a stable numeric code (its wire identity) and a
//! human-readable message that accumulates context through [`FlowError::wrap`].
//! `ExplicitAck` is a sentinel: it travels and is stored like an error but
//! means successful termination, so operations that end by acknowledgement
//! share the teardown path with failing ones. [`FlowError::is_ok`] is the
//! single place that distinction is made.
//!
//! Errors that never cross the wire (map lookups, orchestration) are
//! separate `thiserror` enums in their own modules.

use std::fmt;

use bytes::Bytes;

use crate::codec::{put_varint, read_varint};

/// The kinds of flow errors the fabric distinguishes, with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
    /// Undecodable or unclassified failure.
    Unknown,
    /// Sentinel acknowledgement: successful termination, not a failure.
    ExplicitAck,
    /// The component is shutting down.
    Stopping,
    /// An operation exceeded its time bound.
    Timeout,
    /// A terminal saw no traffic for its idle timeout.
    IdleTimeout,
    /// An internal invariant failed.
    Internal,
    /// A bounded queue had to discard.
    QueueOverflow,
    /// A message arrived that the flow state does not allow.
    UnexpectedMsg,
    /// The underlying connection failed or closed.
    ConnectionError,
    /// A wire code this build does not recognise; the message is preserved.
    Remote(u32),
}

impl FlowErrorKind {
    pub fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::ExplicitAck => 1,
            Self::Stopping => 2,
            Self::Timeout => 3,
            Self::IdleTimeout => 4,
            Self::Internal => 5,
            Self::QueueOverflow => 6,
            Self::UnexpectedMsg => 7,
            Self::ConnectionError => 8,
            Self::Remote(code) => code,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Unknown,
            1 => Self::ExplicitAck,
            2 => Self::Stopping,
            3 => Self::Timeout,
            4 => Self::IdleTimeout,
            5 => Self::Internal,
            6 => Self::QueueOverflow,
            7 => Self::UnexpectedMsg,
            8 => Self::ConnectionError,
            other => Self::Remote(other),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::ExplicitAck => "explicit ack",
            Self::Stopping => "stopping",
            Self::Timeout => "timed out",
            Self::IdleTimeout => "idle timeout",
            Self::Internal => "internal error",
            Self::QueueOverflow => "queue overflow",
            Self::UnexpectedMsg => "unexpected message",
            Self::ConnectionError => "connection error",
            Self::Remote(_) => "remote error",
        }
    }
}

/// An error value with a wire identity. See the module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowError {
    kind: FlowErrorKind,
    message: String,
}

impl FlowError {
    pub fn new(kind: FlowErrorKind) -> Self {
        Self {
            kind,
            message: String::new(),
        }
    }

    pub fn with(kind: FlowErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn ack() -> Self {
        Self::new(FlowErrorKind::ExplicitAck)
    }

    pub fn stopping() -> Self {
        Self::new(FlowErrorKind::Stopping)
    }

    pub fn timeout() -> Self {
        Self::new(FlowErrorKind::Timeout)
    }

    pub fn idle_timeout() -> Self {
        Self::new(FlowErrorKind::IdleTimeout)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with(FlowErrorKind::Internal, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::with(FlowErrorKind::ConnectionError, message)
    }

    pub fn kind(&self) -> FlowErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is(&self, kind: FlowErrorKind) -> bool {
        self.kind == kind
    }

    /// True when this value means success: the explicit-ack sentinel.
    pub fn is_ok(&self) -> bool {
        self.kind == FlowErrorKind::ExplicitAck
    }

    /// Add context in front of the message. The code is preserved.
    pub fn wrap(self, context: impl fmt::Display) -> Self {
        let message = if self.message.is_empty() {
            format!("{context}: {}", self.kind.as_str())
        } else {
            format!("{context}: {}", self.message)
        };
        Self {
            kind: self.kind,
            message,
        }
    }

    /// Wire form: `varint(code) | utf-8 message`.
    pub fn pack(&self) -> Bytes {
        let mut buf = Vec::with_capacity(5 + self.message.len());
        put_varint(&mut buf, self.code());
        buf.extend_from_slice(self.message.as_bytes());
        Bytes::from(buf)
    }

    /// Decode the wire form. Never fails: an unrecognised code becomes a
    /// remote error that still carries the message; a malformed payload
    /// becomes `Unknown`.
    pub fn unpack(data: &[u8]) -> Self {
        let (code, used) = match read_varint(data) {
            Ok(Some(parsed)) => parsed,
            _ => return Self::with(FlowErrorKind::Unknown, "malformed error payload"),
        };
        let message = String::from_utf8_lossy(&data[used..]).into_owned();
        Self {
            kind: FlowErrorKind::from_code(code),
            message,
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{} ({})", self.message, self.kind.as_str())
        }
    }
}

impl std::error::Error for FlowError {}
