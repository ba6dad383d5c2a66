use std::fmt;
use std::sync::Arc;

use amqlink_transport::TransportError;

use crate::registry::RegistryError;

/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] amqlink_frame::FrameError),

    /// Control message serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer answered the connection handshake with something other
    /// than a successful tune, or did not answer at all.
    #[error("invalid handshake response: {0}")]
    InvalidHandshakeResponse(String),

    /// The connection is not open.
    #[error("connection closed")]
    ConnectionClosed,

    /// Every channel id up to the negotiated maximum is in use.
    #[error("too many open channels (channel max {0})")]
    TooManyOpenChannels(u16),

    /// The channel id is not allocated in the state the operation needs.
    #[error("channel {0} is not allocated")]
    UnknownChannel(u16),

    /// The peer replied with a protocol-level error.
    #[error("peer error {code}: {reason}")]
    Remote { code: u16, reason: String },

    /// The peer went away while a response was outstanding.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// One or both phases of connection close failed.
    #[error(transparent)]
    Close(#[from] CombinedCloseError),
}

impl From<RegistryError> for ConnError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Exhausted { channel_max } => Self::TooManyOpenChannels(channel_max),
            RegistryError::NotReserved(id) | RegistryError::NotBound(id) => {
                Self::UnknownChannel(id.get())
            }
        }
    }
}

/// Outcome of a failed connection close.
///
/// Carries the protocol-level failure and the socket-level failure side by
/// side; at least one of them is set. Cloneable so every concurrent closer
/// observes the same value.
#[derive(Debug, Clone)]
pub struct CombinedCloseError {
    /// The broker rejected or never answered the close request.
    pub broker_error: Option<Arc<ConnError>>,
    /// Closing the socket failed (a redundant close is not recorded here).
    pub transport_error: Option<Arc<TransportError>>,
}

impl CombinedCloseError {
    pub fn new(broker_error: Option<ConnError>, transport_error: Option<TransportError>) -> Self {
        Self {
            broker_error: broker_error.map(Arc::new),
            transport_error: transport_error.map(Arc::new),
        }
    }
}

impl fmt::Display for CombinedCloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close failed")?;
        if let Some(err) = &self.broker_error {
            write!(f, "; broker: {err}")?;
        }
        if let Some(err) = &self.transport_error {
            write!(f, "; transport: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CombinedCloseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match (&self.broker_error, &self.transport_error) {
            (Some(err), _) => Some(err.as_ref()),
            (None, Some(err)) => Some(err.as_ref()),
            (None, None) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_close_error_names_both_sides() {
        let err = CombinedCloseError::new(
            Some(ConnError::Remote {
                code: 530,
                reason: "NOT_ALLOWED".to_string(),
            }),
            Some(TransportError::Io(std::io::Error::other("reset"))),
        );
        let text = err.to_string();
        assert!(text.contains("broker: peer error 530: NOT_ALLOWED"));
        assert!(text.contains("transport: transport I/O error: reset"));
    }

    #[test]
    fn combined_close_error_with_broker_side_only() {
        let err = CombinedCloseError::new(Some(ConnError::ConnectionClosed), None);
        assert_eq!(err.to_string(), "close failed; broker: connection closed");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn registry_errors_map_to_connection_errors() {
        let err: ConnError = RegistryError::Exhausted { channel_max: 4 }.into();
        assert!(matches!(err, ConnError::TooManyOpenChannels(4)));
    }
}
