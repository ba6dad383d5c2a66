//! Counting mocks for the transport and multiplexer seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use amqlink_frame::Frame;
use amqlink_transport::{Transport, TransportError};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::control::NOT_ALLOWED;
use crate::error::{ConnError, Result};
use crate::handshake::HandshakeOutcome;
use crate::multiplexer::{ChannelHandle, Multiplexer, RawChannel};
use crate::registry::ChannelId;

pub(crate) struct MockTransport {
    active: AtomicBool,
    pub(crate) close_calls: AtomicUsize,
    close_error: Mutex<Option<TransportError>>,
    closed: watch::Sender<bool>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
            close_error: Mutex::new(None),
            closed: watch::channel(false).0,
        }
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        if !active {
            self.closed.send_replace(true);
        }
    }

    pub(crate) fn fail_close_with(&self, err: TransportError) {
        *self.close_error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn close(&self) -> amqlink_transport::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(TransportError::AlreadyClosed);
        }
        self.closed.send_replace(true);
        match self.close_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

pub(crate) struct MockMultiplexer {
    outcome: Mutex<Option<Result<HandshakeOutcome>>>,
    outbound: mpsc::Sender<Frame>,
    _outbound_rx: mpsc::Receiver<Frame>,
    fail_opens: AtomicBool,
    close_error: Mutex<Option<ConnError>>,
    close_delay: Mutex<Option<Duration>>,
    open_delay: Mutex<Option<Duration>>,
    pub(crate) open_calls: AtomicUsize,
    pub(crate) close_channel_calls: AtomicUsize,
    pub(crate) close_calls: AtomicUsize,
    pub(crate) fail_all_calls: AtomicUsize,
}

impl MockMultiplexer {
    pub(crate) fn new() -> Self {
        let (outbound, outbound_rx) = mpsc::channel(16);
        Self {
            outcome: Mutex::new(None),
            outbound,
            _outbound_rx: outbound_rx,
            fail_opens: AtomicBool::new(false),
            close_error: Mutex::new(None),
            close_delay: Mutex::new(None),
            open_delay: Mutex::new(None),
            open_calls: AtomicUsize::new(0),
            close_channel_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            fail_all_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_outcome(outcome: Result<HandshakeOutcome>) -> Self {
        let mux = Self::new();
        *mux.outcome.lock().unwrap() = Some(outcome);
        mux
    }

    pub(crate) fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_close_with(&self, err: ConnError) {
        *self.close_error.lock().unwrap() = Some(err);
    }

    pub(crate) fn delay_close(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn delay_open(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Multiplexer for MockMultiplexer {
    async fn handshake_result(&self) -> Result<HandshakeOutcome> {
        let outcome = self.outcome.lock().unwrap().take();
        match outcome {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    async fn open_channel(&self, id: ChannelId) -> Result<RawChannel> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(ConnError::Remote {
                code: NOT_ALLOWED,
                reason: "open refused".to_string(),
            });
        }
        let (_inbound_tx, inbound) = mpsc::unbounded_channel();
        Ok(RawChannel {
            handle: ChannelHandle::new(id, self.outbound.clone()),
            inbound,
        })
    }

    async fn close_channel(&self, _id: ChannelId, _code: u16, _reason: &str) -> Result<()> {
        self.close_channel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _reason: &str, _code: u16) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.close_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.close_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fail_all_responses(&self, _error: &ConnError) {
        self.fail_all_calls.fetch_add(1, Ordering::SeqCst);
    }
}
