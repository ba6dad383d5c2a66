//! Default [`Multiplexer`] over JSON control messages and body frames.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use amqlink_frame::{Frame, FrameKind, CONTROL};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::control::{ControlMessage, NOT_ALLOWED};
use crate::error::{ConnError, Result};
use crate::handshake::{evaluate_reply, start_message, HandshakeConfig, HandshakeOutcome};
use crate::multiplexer::{ChannelHandle, FrameHandler, Multiplexer, RawChannel};
use crate::registry::ChannelId;

/// Capacity of the queue between the multiplexer and the I/O pipeline.
pub const OUTBOUND_CAPACITY: usize = 1024;

type Reply = oneshot::Sender<Result<ControlMessage>>;

struct MuxState {
    handshake_tx: Option<oneshot::Sender<Result<HandshakeOutcome>>>,
    pending: HashMap<u16, Reply>,
    inbound: HashMap<u16, mpsc::UnboundedSender<Bytes>>,
    failed: Option<String>,
}

/// Request/response multiplexer for one connection.
///
/// At most one control request is outstanding per channel; exclusive
/// channel id ownership guarantees that for channel-level requests, and
/// the shutdown gate for the connection close.
pub struct FrameMultiplexer {
    config: HandshakeConfig,
    outbound: mpsc::Sender<Frame>,
    state: Mutex<MuxState>,
    handshake_rx: Mutex<Option<oneshot::Receiver<Result<HandshakeOutcome>>>>,
}

impl FrameMultiplexer {
    /// Create a multiplexer and the receiving end the pipeline drains.
    pub fn new(config: HandshakeConfig) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let mux = Self {
            config,
            outbound,
            state: Mutex::new(MuxState {
                handshake_tx: Some(handshake_tx),
                pending: HashMap::new(),
                inbound: HashMap::new(),
                failed: None,
            }),
            handshake_rx: Mutex::new(Some(handshake_rx)),
        };
        (mux, outbound_rx)
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame from a synchronous callback.
    ///
    /// When the outbound queue is full the frame is handed to a task that
    /// waits for room, so replies the peer is owed are never dropped.
    fn queue(&self, message: &ControlMessage, channel: u16) {
        let frame = match message.to_frame(channel) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(method = message.name(), error = %err, "failed to encode control message");
                return;
            }
        };
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                debug!(method = message.name(), channel, "outbound queue full, deferring control frame");
                let outbound = self.outbound.clone();
                let method = message.name();
                tokio::spawn(async move {
                    if outbound.send(frame).await.is_err() {
                        debug!(method, channel, "pipeline gone before deferred control frame was sent");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(method = message.name(), channel, "pipeline closed, control frame not sent");
            }
        }
    }

    async fn request(&self, channel: u16, message: ControlMessage) -> Result<ControlMessage> {
        let frame = message.to_frame(channel)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if let Some(reason) = &state.failed {
                return Err(ConnError::Disconnected(reason.clone()));
            }
            if state.pending.contains_key(&channel) {
                return Err(ConnError::Remote {
                    code: NOT_ALLOWED,
                    reason: format!("request already outstanding on channel {channel}"),
                });
            }
            state.pending.insert(channel, tx);
        }

        if self.outbound.send(frame).await.is_err() {
            self.lock().pending.remove(&channel);
            return Err(ConnError::ConnectionClosed);
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(ConnError::Disconnected(
                "response waiter dropped".to_string(),
            )),
        }
    }

    fn resolve(&self, channel: u16, message: ControlMessage) {
        let waiter = self.lock().pending.remove(&channel);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(message));
            }
            None => warn!(channel, method = message.name(), "reply with no outstanding request"),
        }
    }

    fn complete_handshake(&self, outcome: Result<HandshakeOutcome>) -> bool {
        let tx = self.lock().handshake_tx.take();
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn handshake_pending(&self) -> bool {
        self.lock().handshake_tx.is_some()
    }

    fn on_control(&self, message: ControlMessage) {
        if self.handshake_pending() {
            let outcome = evaluate_reply(&self.config, message);
            debug!(?outcome, "handshake reply received");
            self.complete_handshake(Ok(outcome));
            return;
        }

        match message {
            ControlMessage::Close { code, reason } => {
                debug!(code, %reason, "peer closed the connection");
                self.queue(&ControlMessage::CloseOk, CONTROL);
                // A close of our own that crossed the peer's counts as done.
                if let Some(tx) = self.lock().pending.remove(&CONTROL) {
                    let _ = tx.send(Ok(ControlMessage::CloseOk));
                }
                self.fail_all_responses(&ConnError::Remote { code, reason });
            }
            message @ (ControlMessage::CloseOk | ControlMessage::Error { .. }) => {
                self.resolve(CONTROL, message);
            }
            other => warn!(method = other.name(), "unexpected connection-level method"),
        }
    }

    fn on_channel_control(&self, channel: u16, message: ControlMessage) {
        match message {
            ControlMessage::ChannelClose { code, reason } => {
                debug!(channel, code, %reason, "peer closed channel");
                let (waiter, _inbound) = {
                    let mut state = self.lock();
                    (state.pending.remove(&channel), state.inbound.remove(&channel))
                };
                self.queue(&ControlMessage::ChannelCloseOk, channel);
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(ControlMessage::ChannelClose { code, reason }));
                }
            }
            message @ (ControlMessage::ChannelOpenOk
            | ControlMessage::ChannelCloseOk
            | ControlMessage::Error { .. }) => self.resolve(channel, message),
            other => warn!(channel, method = other.name(), "unexpected channel-level method"),
        }
    }

    fn on_body(&self, frame: Frame) {
        let state = self.lock();
        match state.inbound.get(&frame.channel) {
            Some(tx) => {
                if tx.send(frame.payload).is_err() {
                    trace!(channel = frame.channel, "channel receiver dropped");
                }
            }
            None => warn!(channel = frame.channel, "body frame for a channel that is not open"),
        }
    }
}

#[async_trait]
impl Multiplexer for FrameMultiplexer {
    async fn handshake_result(&self) -> Result<HandshakeOutcome> {
        let rx = self
            .handshake_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(rx) = rx else {
            return Err(ConnError::InvalidHandshakeResponse(
                "handshake result already consumed".to_string(),
            ));
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConnError::Disconnected(
                "handshake abandoned".to_string(),
            )),
        }
    }

    async fn open_channel(&self, id: ChannelId) -> Result<RawChannel> {
        let channel = id.get();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Registered before the request so no body frame after open-ok is lost.
        self.lock().inbound.insert(channel, inbound_tx);

        let reply = self.request(channel, ControlMessage::ChannelOpen).await;
        match reply {
            Ok(ControlMessage::ChannelOpenOk) => {
                debug!(channel, "channel open");
                Ok(RawChannel {
                    handle: ChannelHandle::new(id, self.outbound.clone()),
                    inbound: inbound_rx,
                })
            }
            Ok(other) => {
                self.lock().inbound.remove(&channel);
                Err(other.into_error("channel_open_ok"))
            }
            Err(err) => {
                self.lock().inbound.remove(&channel);
                Err(err)
            }
        }
    }

    async fn close_channel(&self, id: ChannelId, code: u16, reason: &str) -> Result<()> {
        let channel = id.get();
        if !self.lock().inbound.contains_key(&channel) {
            // Already closed by the peer or by a connection failure.
            return Ok(());
        }

        let reply = self
            .request(channel, ControlMessage::channel_close(code, reason))
            .await;
        self.lock().inbound.remove(&channel);
        match reply? {
            ControlMessage::ChannelCloseOk | ControlMessage::ChannelClose { .. } => {
                debug!(channel, "channel closed");
                Ok(())
            }
            other => Err(other.into_error("channel_close_ok")),
        }
    }

    async fn close(&self, reason: &str, code: u16) -> Result<()> {
        let reply = self
            .request(CONTROL, ControlMessage::close(code, reason))
            .await?;
        match reply {
            ControlMessage::CloseOk => {
                self.fail_all_responses(&ConnError::ConnectionClosed);
                Ok(())
            }
            other => Err(other.into_error("close_ok")),
        }
    }

    fn fail_all_responses(&self, error: &ConnError) {
        let reason = match error {
            ConnError::Disconnected(reason) => reason.clone(),
            other => other.to_string(),
        };

        let (handshake_tx, pending) = {
            let mut state = self.lock();
            if state.failed.is_none() {
                state.failed = Some(reason.clone());
            }
            state.inbound.clear();
            (state.handshake_tx.take(), std::mem::take(&mut state.pending))
        };

        if let Some(tx) = handshake_tx {
            let _ = tx.send(Err(ConnError::Disconnected(reason.clone())));
        }
        for (channel, tx) in pending {
            trace!(channel, "failing outstanding request");
            let _ = tx.send(Err(ConnError::Disconnected(reason.clone())));
        }
    }
}

impl FrameHandler for FrameMultiplexer {
    fn on_active(&self) {
        let start = start_message(&self.config);
        debug!(protocol = %self.config.protocol_name, version = %self.config.protocol_version, "sending handshake start");
        self.queue(&start, CONTROL);
    }

    fn on_frame(&self, frame: Frame) {
        trace!(channel = frame.channel, kind = ?frame.kind, size = frame.payload.len(), "frame in");
        match frame.kind {
            FrameKind::Body => self.on_body(frame),
            FrameKind::Method => {
                let message = match ControlMessage::from_frame(&frame) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(channel = frame.channel, error = %err, "undecodable control frame");
                        self.complete_handshake(Ok(HandshakeOutcome::Rejected {
                            reason: format!("undecodable handshake reply: {err}"),
                        }));
                        return;
                    }
                };
                if frame.channel == CONTROL {
                    self.on_control(message);
                } else if self.handshake_pending() {
                    warn!(channel = frame.channel, "channel frame before handshake completed");
                } else {
                    self.on_channel_control(frame.channel, message);
                }
            }
        }
    }

    fn on_inactive(&self, error: Option<&ConnError>) {
        match error {
            Some(err) => {
                debug!(error = %err, "connection stream failed");
                self.fail_all_responses(err);
            }
            None => {
                debug!("connection stream ended");
                self.fail_all_responses(&ConnError::Disconnected(
                    "connection closed by peer".to_string(),
                ));
            }
        }
    }
}
