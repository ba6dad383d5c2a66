//! Connection lifecycle for multiplexed broker connections.
//!
//! One socket carries many logical channels. This crate bootstraps the
//! socket and the handshake ([`connect`]), hands out channel ids safely
//! under concurrent use ([`Connection::open_channel`]), and closes both
//! the protocol session and the socket exactly once ([`Connection::close`]).
//!
//! The protocol itself sits behind the [`Multiplexer`] seam; the default
//! [`FrameMultiplexer`] speaks JSON control methods inside method frames.

pub mod broker;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod control;
pub mod error;
pub mod frame_mux;
pub mod handshake;
pub mod multiplexer;
pub mod pipeline;
pub mod registry;
mod shutdown;
pub mod state;

#[cfg(test)]
mod testing;

pub use broker::{BrokerConfig, LoopbackBroker};
pub use channel::LogicalChannel;
pub use connection::Connection;
pub use connector::{connect, ConnectConfig};
pub use control::{
    ControlMessage, CONNECTION_FORCED, NOT_ALLOWED, NOT_IMPLEMENTED, REPLY_SUCCESS,
    RESOURCE_ERROR, UNEXPECTED_FRAME,
};
pub use error::{CombinedCloseError, ConnError, Result};
pub use frame_mux::FrameMultiplexer;
pub use handshake::{HandshakeConfig, HandshakeOutcome};
pub use multiplexer::{ChannelHandle, FrameHandler, Multiplexer, RawChannel};
pub use pipeline::SocketTransport;
pub use registry::{ChannelId, ChannelRegistry, RegistryError};
pub use state::{ConnectionState, StateMachine};
