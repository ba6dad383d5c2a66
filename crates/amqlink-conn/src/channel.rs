use std::fmt;
use std::sync::Weak;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionInner};
use crate::control::REPLY_SUCCESS;
use crate::error::{ConnError, Result};
use crate::multiplexer::ChannelHandle;
use crate::registry::ChannelId;
use crate::state::ConnectionState;

/// A logical channel multiplexed over a [`Connection`].
///
/// The channel does not keep its connection alive. Its id stays allocated
/// until [`close`](Self::close) is called, the channel is dropped or the
/// connection closes. Dropping an open channel closes it on the broker in
/// the background and frees the id once the broker has answered.
pub struct LogicalChannel {
    id: ChannelId,
    handle: ChannelHandle,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    connection: Weak<ConnectionInner>,
    released: bool,
}

impl LogicalChannel {
    pub(crate) fn new(
        id: ChannelId,
        handle: ChannelHandle,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        connection: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            id,
            handle,
            inbound,
            connection,
            released: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The owning connection, if it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.connection.upgrade().map(Connection::from_inner)
    }

    /// Send an opaque payload as a body frame.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let connected = self
            .connection
            .upgrade()
            .is_some_and(|inner| inner.is_connected());
        if !connected {
            return Err(ConnError::ConnectionClosed);
        }
        self.handle.send(payload.into()).await
    }

    /// Next payload from the peer, or `None` once the channel or the
    /// connection is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Close with reply code 200.
    pub async fn close(self) -> Result<()> {
        self.close_with(REPLY_SUCCESS, "").await
    }

    /// Close the channel and free its id.
    pub async fn close_with(mut self, code: u16, reason: &str) -> Result<()> {
        self.released = true;
        let inner = self
            .connection
            .upgrade()
            .ok_or(ConnError::ConnectionClosed)?;

        match inner.state.current() {
            ConnectionState::Open => {}
            ConnectionState::ShuttingDown | ConnectionState::Closed => {
                return Err(ConnError::ConnectionClosed);
            }
        }

        let result = inner.multiplexer.close_channel(self.id, code, reason).await;
        inner.remove_channel(self.id);
        result
    }
}

impl Drop for LogicalChannel {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(inner) = self.connection.upgrade() else {
            return;
        };
        match inner.state.current() {
            ConnectionState::Open => {}
            // The connection close frees every id.
            ConnectionState::ShuttingDown | ConnectionState::Closed => return,
        }

        let id = self.id;
        match Handle::try_current() {
            Ok(runtime) => {
                debug!(connection = inner.id, channel = %id, "channel dropped without close");
                runtime.spawn(async move {
                    if let Err(err) = inner
                        .multiplexer
                        .close_channel(id, REPLY_SUCCESS, "")
                        .await
                    {
                        debug!(connection = inner.id, channel = %id, error = %err, "closing dropped channel failed");
                    }
                    inner.remove_channel(id);
                });
            }
            Err(_) => {
                warn!(connection = inner.id, channel = %id, "channel dropped outside a runtime, freeing its id without a broker close");
                inner.remove_channel(id);
            }
        }
    }
}

impl fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalChannel")
            .field("id", &self.id)
            .finish()
    }
}
