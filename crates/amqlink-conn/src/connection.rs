use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use amqlink_transport::Transport;
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::channel::LogicalChannel;
use crate::control::REPLY_SUCCESS;
use crate::error::{CombinedCloseError, ConnError, Result};
use crate::multiplexer::{ChannelHandle, Multiplexer};
use crate::registry::{ChannelId, ChannelRegistry};
use crate::shutdown;
use crate::state::{ConnectionState, StateMachine};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type CloseOutcome = std::result::Result<(), CombinedCloseError>;

pub(crate) struct ConnectionInner {
    pub(crate) id: u64,
    pub(crate) server_id: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) multiplexer: Arc<dyn Multiplexer>,
    pub(crate) state: StateMachine,
    registry: Mutex<ChannelRegistry<ChannelHandle>>,
    /// Serializes channel id reservation and the shutdown gate.
    pub(crate) serial: tokio::sync::Mutex<()>,
    pub(crate) close_outcome: watch::Sender<Option<CloseOutcome>>,
    pub(crate) close_timeout: Option<Duration>,
}

impl ConnectionInner {
    pub(crate) fn registry(&self) -> MutexGuard<'_, ChannelRegistry<ChannelHandle>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an opened channel, unless a close has started since its id
    /// was reserved.
    fn bind(&self, id: ChannelId, handle: ChannelHandle) -> Result<()> {
        let mut registry = self.registry();
        match self.state.current() {
            ConnectionState::Open => Ok(registry.bind(id, handle)?),
            ConnectionState::ShuttingDown | ConnectionState::Closed => {
                Err(ConnError::ConnectionClosed)
            }
        }
    }

    /// Free a reserved id; a close may already have cleared it.
    pub(crate) fn release(&self, id: ChannelId) {
        if let Err(err) = self.registry().release(id) {
            trace!(connection = self.id, channel = %id, error = %err, "channel id already released");
        }
    }

    /// Free a bound id; a close may already have cleared it.
    pub(crate) fn remove_channel(&self, id: ChannelId) {
        match self.registry().remove(id) {
            Ok(_) => debug!(connection = self.id, channel = %id, "channel released"),
            Err(err) => {
                trace!(connection = self.id, channel = %id, error = %err, "channel id already released")
            }
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        match self.state.current() {
            ConnectionState::Open => self.transport.is_active(),
            ConnectionState::ShuttingDown | ConnectionState::Closed => false,
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        match self.state.current() {
            ConnectionState::Closed => {}
            state @ (ConnectionState::Open | ConnectionState::ShuttingDown) => {
                error!(
                    connection = self.id,
                    server_id = %self.server_id,
                    state = state.as_str(),
                    "connection dropped without being closed"
                );
            }
        }
    }
}

/// A connection to a broker.
///
/// Cloning is cheap; every clone refers to the same connection. A
/// connection starts `Open` and only ever moves forward, so once closed it
/// stays closed. Call [`close`](Self::close) before dropping the last clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        multiplexer: Arc<dyn Multiplexer>,
        channel_max: u16,
        server_id: String,
        close_timeout: Option<Duration>,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, channel_max, %server_id, "connection open");
        let (close_outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                server_id,
                transport,
                multiplexer,
                state: StateMachine::new(),
                registry: Mutex::new(ChannelRegistry::new(channel_max)),
                serial: tokio::sync::Mutex::new(()),
                close_outcome,
                close_timeout,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Process-unique identifier, used in log events.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Identifier the broker reported during the handshake.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// True while the transport is up and no close has started.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Channel maximum negotiated with the broker.
    pub fn channel_max(&self) -> u16 {
        self.inner.registry().channel_max()
    }

    /// Number of channel ids currently allocated.
    pub fn open_channels(&self) -> usize {
        self.inner.registry().len()
    }

    /// Open a new logical channel on the lowest free channel id.
    ///
    /// A failed open leaves the id free for the next caller and does not
    /// affect the connection state. The broker round-trip runs outside the
    /// serial context, so a close started meanwhile is not held up by it.
    pub async fn open_channel(&self) -> Result<LogicalChannel> {
        if !self.is_connected() {
            return Err(ConnError::ConnectionClosed);
        }

        let id = {
            let _serial = self.inner.serial.lock().await;
            if !self.is_connected() {
                return Err(ConnError::ConnectionClosed);
            }
            self.inner.registry().reserve_next()?
        };

        let raw = match self.inner.multiplexer.open_channel(id).await {
            Ok(raw) => raw,
            Err(err) => {
                self.inner.release(id);
                debug!(connection = self.inner.id, channel = %id, error = %err, "channel open failed");
                return Err(err);
            }
        };

        let (handle, inbound) = raw.into_parts();
        if let Err(err) = self.inner.bind(id, handle.clone()) {
            debug!(connection = self.inner.id, channel = %id, error = %err, "opened channel could not be bound");
            self.inner.release(id);
            // A connection close tears the channel down with it.
            if self.state() == ConnectionState::Open {
                if let Err(close_err) = self
                    .inner
                    .multiplexer
                    .close_channel(id, REPLY_SUCCESS, "")
                    .await
                {
                    debug!(connection = self.inner.id, channel = %id, error = %close_err, "closing unbound channel failed");
                }
            }
            return Err(err);
        }

        debug!(connection = self.inner.id, channel = %id, "channel bound");
        Ok(LogicalChannel::new(
            id,
            handle,
            inbound,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Close the connection.
    ///
    /// Only the first call performs the close; every call, concurrent or
    /// later, returns the same outcome. Fails with [`ConnError::Close`]
    /// when the protocol close or the socket close failed. The connection
    /// ends up `Closed` either way.
    pub async fn close(&self, reason: &str, code: u16) -> Result<()> {
        shutdown::close(&self.inner, reason, code).await
    }

    /// [`close`](Self::close) with an empty reason and reply code 200.
    pub async fn close_default(&self) -> Result<()> {
        self.close("", REPLY_SUCCESS).await
    }

    /// Resolves once the underlying transport has shut down, whichever side
    /// initiated it.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let transport = Arc::clone(&self.inner.transport);
        async move { transport.closed().await }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("server_id", &self.inner.server_id)
            .field("state", &self.inner.state.current())
            .finish()
    }
}
