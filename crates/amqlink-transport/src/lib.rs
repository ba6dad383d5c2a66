//! Byte transport for amqlink connections.
//!
//! Establishes the physical connection a broker session runs over:
//! - TCP sockets with reuse-address and no-delay set
//! - Optional TLS wrapping (rustls) with SNI and custom trust roots
//!
//! This is the lowest layer of amqlink. Everything else builds on top of
//! the [`TransportStream`] type and the [`Transport`] seam provided here.

pub mod config;
pub mod error;
pub mod tcp;
pub mod tls;
pub mod traits;

pub use config::{CertConfig, TlsMode, TransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT};
pub use error::{Result, TransportError};
pub use tcp::connect;
pub use traits::{Transport, TransportStream};
