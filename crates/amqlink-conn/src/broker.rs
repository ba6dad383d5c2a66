//! Minimal in-process broker speaking the default wire format.
//!
//! Implements the broker side of the handshake, channel open/close, echo
//! of body frames and connection close. Used by the integration tests and
//! by `amqlink serve`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use amqlink_frame::{Frame, FrameCodec, FrameKind, CONTROL};
use amqlink_transport::{TransportError, TransportStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::control::{ControlMessage, NOT_ALLOWED, UNEXPECTED_FRAME};
use crate::error::Result;
use crate::handshake::{accept_start, tune_message, HandshakeConfig};

/// Broker-side settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Protocol name, version and channel maximum offered in `tune`.
    pub handshake: HandshakeConfig,
    /// Identifier reported in `tune`.
    pub server_id: String,
    /// Answer every connection close with an error instead of `close_ok`.
    pub reject_close: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            server_id: "amqlink-loopback".to_string(),
            reject_close: false,
        }
    }
}

impl BrokerConfig {
    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.handshake.channel_max = channel_max;
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_reject_close(mut self, reject: bool) -> Self {
        self.reject_close = reject;
        self
    }
}

/// Listens for and serves client connections.
pub struct LoopbackBroker {
    listener: TcpListener,
    config: Arc<BrokerConfig>,
    next_session: AtomicU64,
}

impl LoopbackBroker {
    /// Bind a TCP listener.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::from)?;
        Ok(Self {
            listener,
            config: Arc::new(BrokerConfig::default()),
            next_session: AtomicU64::new(1),
        })
    }

    /// Override broker settings.
    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(TransportError::from)?)
    }

    /// Accept one connection and serve it on a new task.
    pub async fn accept(&self) -> Result<JoinHandle<Result<()>>> {
        let (stream, peer) = self.listener.accept().await.map_err(TransportError::from)?;
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session, %peer, "accepted connection");
        let config = Arc::clone(&self.config);
        Ok(tokio::spawn(async move {
            let result = serve_session(stream, config, session).await;
            if let Err(err) = &result {
                warn!(session, error = %err, "session ended with error");
            }
            result
        }))
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "loopback broker listening");
        loop {
            self.accept().await?;
        }
    }
}

async fn serve_session(stream: TcpStream, config: Arc<BrokerConfig>, session: u64) -> Result<()> {
    stream.set_nodelay(true).map_err(TransportError::from)?;
    let mut framed = Framed::new(
        TransportStream::from(stream),
        FrameCodec::new(config.handshake.max_frame_payload),
    );

    let Some(first) = framed.next().await else {
        return Ok(());
    };
    let start = ControlMessage::from_frame(&first?)?;
    let channel_max = match accept_start(&config.handshake, &start) {
        Ok(channel_max) => channel_max,
        Err(reason) => {
            debug!(session, %reason, "refusing handshake");
            framed
                .send(ControlMessage::Refuse { reason }.to_frame(CONTROL)?)
                .await?;
            return Ok(());
        }
    };
    framed
        .send(tune_message(&config.handshake, &config.server_id, channel_max).to_frame(CONTROL)?)
        .await?;
    debug!(session, channel_max, "handshake complete");

    let mut open: HashSet<u16> = HashSet::new();
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let channel = frame.channel;

        if frame.kind == FrameKind::Body {
            let reply = if open.contains(&channel) {
                Frame::body(channel, frame.payload)
            } else {
                ControlMessage::error(UNEXPECTED_FRAME, "channel is not open").to_frame(channel)?
            };
            framed.send(reply).await?;
            continue;
        }

        let message = ControlMessage::from_frame(&frame)?;
        let reply = match (channel, message) {
            (CONTROL, ControlMessage::Close { code, reason }) => {
                debug!(session, code, %reason, "client closed connection");
                if config.reject_close {
                    framed
                        .send(ControlMessage::error(NOT_ALLOWED, "close rejected").to_frame(CONTROL)?)
                        .await?;
                } else {
                    framed.send(ControlMessage::CloseOk.to_frame(CONTROL)?).await?;
                }
                return Ok(());
            }
            (CONTROL, ControlMessage::CloseOk) => return Ok(()),
            (CONTROL, other) => ControlMessage::error(
                UNEXPECTED_FRAME,
                format!("unexpected '{}' on channel 0", other.name()),
            ),
            (_, ControlMessage::ChannelOpen) if channel > channel_max => {
                ControlMessage::error(NOT_ALLOWED, format!("channel {channel} above channel max {channel_max}"))
            }
            (_, ControlMessage::ChannelOpen) => {
                if open.insert(channel) {
                    ControlMessage::ChannelOpenOk
                } else {
                    ControlMessage::error(NOT_ALLOWED, format!("channel {channel} already open"))
                }
            }
            (_, ControlMessage::ChannelClose { .. }) => {
                open.remove(&channel);
                ControlMessage::ChannelCloseOk
            }
            (_, ControlMessage::ChannelCloseOk) => {
                open.remove(&channel);
                continue;
            }
            (_, other) => ControlMessage::error(
                UNEXPECTED_FRAME,
                format!("unexpected '{}' on channel {channel}", other.name()),
            ),
        };
        framed.send(reply.to_frame(channel)?).await?;
    }

    debug!(session, "client disconnected");
    Ok(())
}
