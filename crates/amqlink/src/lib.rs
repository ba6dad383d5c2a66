//! Multiplexed broker connections over a single socket.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP/TLS socket bootstrap and the `Transport` seam
//! - [`frame`]: Channel-multiplexed frame model and codec
//! - [`conn`]: Connection lifecycle: channel registry, state machine,
//!   handshake, shutdown (behind `conn` feature)

/// Re-export transport types.
pub mod transport {
    pub use amqlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use amqlink_frame::*;
}

/// Re-export connection types (requires `conn` feature).
#[cfg(feature = "conn")]
pub mod conn {
    pub use amqlink_conn::*;
}

#[cfg(feature = "conn")]
pub use amqlink_conn::{connect, ConnectConfig, Connection, LogicalChannel};
