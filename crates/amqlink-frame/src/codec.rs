use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, Result};

/// Frame header: type (1) + channel (2) + length (4) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Marker byte terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Default maximum payload size: 128 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 128 * 1024;

/// Kind of a frame, from the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Protocol method (control messages).
    Method,
    /// Opaque application payload.
    Body,
}

impl FrameKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Method => 1,
            FrameKind::Body => 3,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Method),
            3 => Ok(FrameKind::Body),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// A framed message with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Method or body.
    pub kind: FrameKind,
    /// The channel this frame belongs to.
    pub channel: u16,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a method frame.
    pub fn method(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Method,
            channel,
            payload: payload.into(),
        }
    }

    /// Create a body frame.
    pub fn body(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Body,
            channel,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload + frame end).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + 1
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬───────────┬───────────┬─────────────────┬──────────┐
/// │ Type     │ Channel   │ Length    │ Payload         │ End      │
/// │ (1B)     │ (2B BE)   │ (4B BE)   │ (Length bytes)  │ 0xCE     │
/// └──────────┴───────────┴───────────┴─────────────────┴──────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_u8(frame.kind.as_u8());
    dst.put_u16(frame.channel);
    dst.put_u32(frame.payload.len() as u32);
    dst.put_slice(&frame.payload);
    dst.put_u8(FRAME_END);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let kind = FrameKind::from_u8(src[0])?;
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len + 1;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let end = src[total - 1];
    if end != FRAME_END {
        return Err(FrameError::InvalidFrameEnd(end));
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    src.advance(1);

    Ok(Some(Frame {
        kind,
        channel,
        payload,
    }))
}

/// `tokio_util` codec for [`Frame`]s.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let frame = decode_frame(src, self.max_payload)?;
        if let Some(frame) = &frame {
            trace!(
                channel = frame.channel,
                kind = ?frame.kind,
                size = frame.payload.len(),
                "decoded frame"
            );
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload,
            });
        }
        encode_frame(&frame, dst)
    }
}
