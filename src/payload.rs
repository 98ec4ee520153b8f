//! Segmented byte container for message payloads.
//!
//! Message data is assembled from pieces that arrive at different times:
//! headers are prepended when a message is packed, and whole packed messages
//! are appended when the crane coalesces a shipment. [`Payload`] keeps the
//! pieces as `Bytes` segments so both operations move references instead of
//! copying; the bytes are only laid out contiguously once, at write time.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// An append-only byte container with cheap prepend and O(1) concatenation.
#[derive(Debug, Default, Clone)]
pub struct Payload {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let len = data.len();
        let mut segments = VecDeque::with_capacity(4);
        if !data.is_empty() {
            segments.push_back(data);
        }
        Self { segments, len }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Put `data` in front of everything currently held.
    pub fn prepend(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_front(data);
    }

    /// Add `data` after everything currently held.
    pub fn push(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    /// Move all of `other`'s segments to the end of `self`. The data is
    /// moved, not copied.
    pub fn append(&mut self, mut other: Payload) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
        other.len = 0;
    }

    /// Copy the payload contiguously into `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.len);
        for segment in &self.segments {
            dst.extend_from_slice(segment);
        }
    }

    /// Lay the payload out as one contiguous `Bytes`.
    pub fn into_bytes(mut self) -> Bytes {
        if self.segments.len() == 1 {
            return self.segments.pop_front().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.len);
        self.write_to(&mut buf);
        buf.freeze()
    }

    #[cfg(test)]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.len);
        self.write_to(&mut buf);
        buf.to_vec()
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(Bytes::from(data))
    }
}
