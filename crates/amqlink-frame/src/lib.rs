//! Channel-multiplexed frame model and codec for broker connections.
//!
//! Every frame on the wire carries:
//! - A 1-byte frame type (method or body)
//! - A 2-byte big-endian channel ID for multiplexing
//! - A 4-byte big-endian payload length
//! - The payload, followed by the `0xCE` frame-end marker
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed` so the connection
//! pipeline never handles partial reads.

pub mod channel;
pub mod codec;
pub mod error;

pub use channel::{CONTROL, DEFAULT_CHANNEL_MAX, PROTOCOL_CHANNEL_MAX};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameKind, DEFAULT_MAX_PAYLOAD, FRAME_END,
    HEADER_SIZE,
};
pub use error::{FrameError, Result};
