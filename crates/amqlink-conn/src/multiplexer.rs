//! Seams between the connection core and the protocol machinery.
//!
//! The core never parses frames itself. It drives a [`Multiplexer`] for
//! every protocol-level exchange, while the I/O pipeline feeds decoded
//! frames into a [`FrameHandler`].

use std::fmt;

use amqlink_frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ConnError, Result};
use crate::handshake::HandshakeOutcome;
use crate::registry::ChannelId;

/// Protocol multiplexer shared by a connection and its pipeline.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Resolves once the connection handshake finishes, one way or the other.
    async fn handshake_result(&self) -> Result<HandshakeOutcome>;

    /// Run the channel-open exchange for `id`.
    async fn open_channel(&self, id: ChannelId) -> Result<RawChannel>;

    /// Run the channel-close exchange for `id`.
    async fn close_channel(&self, id: ChannelId, code: u16, reason: &str) -> Result<()>;

    /// Run the connection-close exchange.
    async fn close(&self, reason: &str, code: u16) -> Result<()>;

    /// Fail every outstanding response waiter with `error`.
    fn fail_all_responses(&self, error: &ConnError);
}

/// Callbacks the I/O pipeline invokes, in order, from its task.
pub trait FrameHandler: Send + Sync {
    /// The stream is installed; nothing has been read yet.
    fn on_active(&self);

    /// A complete frame arrived.
    fn on_frame(&self, frame: Frame);

    /// The stream is gone. `error` is set when it ended abnormally.
    fn on_inactive(&self, error: Option<&ConnError>);
}

/// Sending half of an open channel.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    outbound: mpsc::Sender<Frame>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, outbound: mpsc::Sender<Frame>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue `payload` as a body frame on this channel.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.outbound
            .send(Frame::body(self.id.get(), payload))
            .await
            .map_err(|_| ConnError::ConnectionClosed)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle").field("id", &self.id).finish()
    }
}

/// A channel as the multiplexer hands it out after a successful open.
#[derive(Debug)]
pub struct RawChannel {
    pub handle: ChannelHandle,
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl RawChannel {
    pub fn id(&self) -> ChannelId {
        self.handle.id()
    }

    pub fn into_parts(self) -> (ChannelHandle, mpsc::UnboundedReceiver<Bytes>) {
        (self.handle, self.inbound)
    }
}
