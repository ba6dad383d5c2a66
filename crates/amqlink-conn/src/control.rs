use amqlink_frame::{Frame, FrameKind};
use serde::{Deserialize, Serialize};

use crate::error::{ConnError, Result};

/// Reply code for a successful close.
pub const REPLY_SUCCESS: u16 = 200;
/// The peer forced the connection closed.
pub const CONNECTION_FORCED: u16 = 320;
/// A method arrived that is not valid in the current state.
pub const UNEXPECTED_FRAME: u16 = 505;
/// The peer ran out of a resource (e.g. channel ids).
pub const RESOURCE_ERROR: u16 = 506;
/// The operation is not allowed (e.g. opening an already open channel).
pub const NOT_ALLOWED: u16 = 530;
/// The method is not implemented by the peer.
pub const NOT_IMPLEMENTED: u16 = 540;

/// Control method carried as JSON inside a method frame.
///
/// Connection-level methods travel on channel 0; channel-level methods on
/// the channel they concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client greeting that opens the handshake.
    Start {
        protocol: String,
        version: String,
        channel_max: u16,
    },
    /// Server acceptance carrying its limits.
    Tune {
        protocol: String,
        version: String,
        channel_max: u16,
        server_id: String,
    },
    /// Server refusal of the handshake.
    Refuse { reason: String },
    ChannelOpen,
    ChannelOpenOk,
    ChannelClose { code: u16, reason: String },
    ChannelCloseOk,
    Close { code: u16, reason: String },
    CloseOk,
    /// Failure reply to a request.
    Error { code: u16, reason: String },
}

impl ControlMessage {
    /// Create a connection close request.
    pub fn close(code: u16, reason: &str) -> Self {
        Self::Close {
            code,
            reason: reason.to_string(),
        }
    }

    /// Create a channel close request.
    pub fn channel_close(code: u16, reason: &str) -> Self {
        Self::ChannelClose {
            code,
            reason: reason.to_string(),
        }
    }

    /// Create an error reply.
    pub fn error(code: u16, reason: impl Into<String>) -> Self {
        Self::Error {
            code,
            reason: reason.into(),
        }
    }

    /// Method name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Tune { .. } => "tune",
            Self::Refuse { .. } => "refuse",
            Self::ChannelOpen => "channel_open",
            Self::ChannelOpenOk => "channel_open_ok",
            Self::ChannelClose { .. } => "channel_close",
            Self::ChannelCloseOk => "channel_close_ok",
            Self::Close { .. } => "close",
            Self::CloseOk => "close_ok",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as a method frame on `channel`.
    pub fn to_frame(&self, channel: u16) -> Result<Frame> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::method(channel, payload))
    }

    /// Decode from a method frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.kind != FrameKind::Method {
            return Err(ConnError::Remote {
                code: UNEXPECTED_FRAME,
                reason: format!("expected method frame on channel {}", frame.channel),
            });
        }
        Ok(serde_json::from_slice(&frame.payload)?)
    }

    /// Map a failure reply to an error, or an unexpected reply to a
    /// protocol error naming `expected`.
    pub fn into_error(self, expected: &str) -> ConnError {
        match self {
            Self::Error { code, reason }
            | Self::ChannelClose { code, reason }
            | Self::Close { code, reason } => ConnError::Remote { code, reason },
            other => ConnError::Remote {
                code: UNEXPECTED_FRAME,
                reason: format!("expected {expected}, got {}", other.name()),
            },
        }
    }
}
