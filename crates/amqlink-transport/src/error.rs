use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in broker transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Host name resolution failed or yielded no addresses.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The connect attempt did not finish within the configured timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The TLS handshake with the peer failed.
    #[error("tls handshake failed: {0}")]
    Tls(std::io::Error),

    /// The name used for SNI / certificate verification is not valid.
    #[error("invalid tls server name '{0}'")]
    InvalidServerName(String),

    /// A trust root could not be loaded.
    #[error("failed to load certificate {path}: {message}")]
    Certificate { path: PathBuf, message: String },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was already closed when a close was requested.
    #[error("transport already closed")]
    AlreadyClosed,
}

impl TransportError {
    /// True for the redundant-close indicator.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
