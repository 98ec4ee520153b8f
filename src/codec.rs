//! Crane wire framing.
//!
//! Each frame on a crane link is `varint(len) | flow id (4 bytes BE) |
//! kind (1 byte) | payload`, where the varint covers everything after
//! itself. Multiple frames may share one write; the decoder demarcates by
//! the leading varint.
//!
//! Oversized frames are skipped in a draining mode rather than killing the
//! connection — a misbehaving peer flow must not take down the whole crane
//! with all its other flows.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::msg::MsgKind;

/// Frames above this size are discarded by the decoder.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Flow id + kind byte.
pub const FRAME_HEADER_SIZE: usize = 5;

/// A u32 LEB128 varint never exceeds five bytes.
const MAX_VARINT_LEN: usize = 5;

/// Codec failure: a malformed varint means the stream framing is lost and
/// the connection cannot be recovered.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed length varint")]
    MalformedVarint,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append `value` as a LEB128 varint.
pub fn put_varint(dst: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.push(byte);
            return;
        }
        dst.push(byte | 0x80);
    }
}

/// Read a LEB128 varint from the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed, `Err` when five bytes did
/// not terminate the varint.
pub fn read_varint(src: &[u8]) -> Result<Option<(u32, usize)>, CodecError> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(CodecError::MalformedVarint);
    }
    Ok(None)
}

/// One decoded wire frame. The payload is opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flow_id: u32,
    pub kind: MsgKind,
    pub payload: Bytes,
}

/// Decoder for the crane frame stream.
#[derive(Debug, Default)]
pub struct CraneCodec {
    /// Bytes of an oversized frame still to be drained.
    skip_remaining: usize,
}

impl Decoder for CraneCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            // Drain an oversized frame before looking for the next one.
            if self.skip_remaining > 0 {
                let n = self.skip_remaining.min(src.len());
                src.advance(n);
                self.skip_remaining -= n;
                if self.skip_remaining > 0 {
                    return Ok(None);
                }
                warn!("codec: finished draining oversized frame");
            }

            let (len, varint_len) = match read_varint(&src[..])? {
                Some(parsed) => parsed,
                None => return Ok(None),
            };
            let len = len as usize;

            if len > MAX_FRAME_SIZE {
                warn!(bytes = len, "codec: skipping oversized frame");
                src.advance(varint_len);
                self.skip_remaining = len;
                continue;
            }

            if src.len() < varint_len + len {
                src.reserve(varint_len + len - src.len());
                return Ok(None);
            }
            src.advance(varint_len);
            let mut frame = src.split_to(len).freeze();

            if frame.len() < FRAME_HEADER_SIZE {
                warn!(bytes = frame.len(), "codec: dropping runt frame");
                continue;
            }

            let flow_id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let kind = MsgKind::from_wire(frame[4]);
            frame.advance(FRAME_HEADER_SIZE);

            return Ok(Some(Frame {
                flow_id,
                kind,
                payload: frame,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(flow_id: u32, kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        body.extend_from_slice(&flow_id.to_be_bytes());
        body.push(kind);
        body.extend_from_slice(payload);

        let mut out = Vec::new();
        put_varint(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
        out
    }

    // ── Varint ───────────────────────────────────────────────────

    #[test]
    fn varint_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 16_383, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            let (decoded, used) = read_varint(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn varint_incomplete_wants_more() {
        assert!(read_varint(&[0x80, 0x80]).unwrap().is_none());
    }

    #[test]
    fn varint_overlong_is_an_error() {
        assert!(read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80]).is_err());
    }

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_complete_frame() {
        let mut codec = CraneCodec::default();
        let mut buf = BytesMut::from(&frame_bytes(7, 2, b"hello")[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.flow_id, 7);
        assert_eq!(frame.kind, MsgKind::Data);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = CraneCodec::default();
        let bytes = frame_bytes(1, 2, b"split across reads");
        let mut buf = BytesMut::from(&bytes[..4]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[4..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"split across reads");
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut codec = CraneCodec::default();
        let mut bytes = frame_bytes(1, 1, b"init");
        bytes.extend_from_slice(&frame_bytes(2, 2, b"data"));
        let mut buf = BytesMut::from(&bytes[..]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.flow_id, 1);
        assert_eq!(first.kind, MsgKind::Init);

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.flow_id, 2);
        assert_eq!(second.kind, MsgKind::Data);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_empty_payload_frame() {
        let mut codec = CraneCodec::default();
        let mut buf = BytesMut::from(&frame_bytes(3, 3, b"")[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.flow_id, 3);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn decode_unknown_kind_byte() {
        let mut codec = CraneCodec::default();
        let mut buf = BytesMut::from(&frame_bytes(9, 0xEE, b"x")[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, MsgKind::Unknown(0xEE));
    }

    #[test]
    fn decode_skips_oversized_frame_and_continues() {
        let mut codec = CraneCodec::default();

        // Claimed length far above the cap, followed by a valid frame.
        let mut bytes = Vec::new();
        put_varint(&mut bytes, (MAX_FRAME_SIZE + 100) as u32);
        bytes.extend_from_slice(&vec![0u8; MAX_FRAME_SIZE + 100]);
        bytes.extend_from_slice(&frame_bytes(5, 2, b"after"));
        let mut buf = BytesMut::from(&bytes[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.flow_id, 5);
        assert_eq!(&frame.payload[..], b"after");
    }

    #[test]
    fn decode_drains_oversized_frame_across_reads() {
        let mut codec = CraneCodec::default();

        let mut bytes = Vec::new();
        put_varint(&mut bytes, (MAX_FRAME_SIZE + 10) as u32);
        bytes.extend_from_slice(&vec![0u8; 1000]);
        let mut buf = BytesMut::from(&bytes[..]);

        // Partial oversized body: nothing decodable yet.
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // Rest of the oversized body plus a valid frame.
        let mut rest = vec![0u8; MAX_FRAME_SIZE + 10 - 1000];
        rest.extend_from_slice(&frame_bytes(6, 2, b"ok"));
        buf.extend_from_slice(&rest);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.flow_id, 6);
    }

    #[test]
    fn decode_drops_runt_frame() {
        let mut codec = CraneCodec::default();
        // Frame body shorter than the fixed header.
        let mut bytes = Vec::new();
        put_varint(&mut bytes, 3);
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend_from_slice(&frame_bytes(4, 2, b"good"));
        let mut buf = BytesMut::from(&bytes[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.flow_id, 4);
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = CraneCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
