use std::sync::Arc;
use std::time::Duration;

use amqlink_frame::FrameCodec;
use amqlink_transport::{TlsMode, Transport, TransportConfig};
use tokio::time::timeout;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{ConnError, Result};
use crate::frame_mux::FrameMultiplexer;
use crate::handshake::{HandshakeConfig, HandshakeOutcome};
use crate::multiplexer::{FrameHandler, Multiplexer};
use crate::pipeline;

/// Everything [`connect`] needs.
#[derive(Debug, Clone, Default)]
pub struct ConnectConfig {
    pub transport: TransportConfig,
    pub handshake: HandshakeConfig,
    /// Upper bound on the protocol close exchange. `None` waits for the
    /// broker indefinitely.
    pub close_timeout: Option<Duration>,
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportConfig::new(host, port),
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.transport = self.transport.with_tls(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport = self.transport.with_connect_timeout(timeout);
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }
}

/// Connect to a broker and complete the handshake.
pub async fn connect(config: &ConnectConfig) -> Result<Connection> {
    config.handshake.validate()?;

    let (multiplexer, outbound) = FrameMultiplexer::new(config.handshake.clone());
    let multiplexer = Arc::new(multiplexer);

    let stream = match amqlink_transport::connect(&config.transport).await {
        Ok(stream) => stream,
        Err(err) => {
            let err = ConnError::from(err);
            multiplexer.fail_all_responses(&err);
            return Err(err);
        }
    };
    debug!(
        peer = %stream.peer_addr(),
        tls = stream.is_tls(),
        "socket connected; installing frame pipeline"
    );

    let handler: Arc<dyn FrameHandler> = multiplexer.clone();
    let transport = pipeline::spawn(
        stream,
        FrameCodec::new(config.handshake.max_frame_payload),
        handler,
        outbound,
    );

    establish(
        Arc::new(transport),
        multiplexer,
        config.handshake.timeout,
        config.close_timeout,
    )
    .await
}

/// Wait for the handshake on an installed pipeline and wrap the result.
pub(crate) async fn establish(
    transport: Arc<dyn Transport>,
    multiplexer: Arc<dyn Multiplexer>,
    handshake_timeout: Duration,
    close_timeout: Option<Duration>,
) -> Result<Connection> {
    let outcome = match timeout(handshake_timeout, multiplexer.handshake_result()).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            let err = ConnError::InvalidHandshakeResponse(err.to_string());
            return Err(abort(&*transport, &*multiplexer, err).await);
        }
        Err(_) => {
            let err = ConnError::InvalidHandshakeResponse(format!(
                "no handshake reply within {handshake_timeout:?}"
            ));
            return Err(abort(&*transport, &*multiplexer, err).await);
        }
    };

    match outcome {
        HandshakeOutcome::Connected {
            channel_max,
            server_id,
        } => Ok(Connection::new(
            transport,
            multiplexer,
            channel_max,
            server_id,
            close_timeout,
        )),
        HandshakeOutcome::Rejected { reason } => {
            let err = ConnError::InvalidHandshakeResponse(reason);
            Err(abort(&*transport, &*multiplexer, err).await)
        }
    }
}

async fn abort(transport: &dyn Transport, multiplexer: &dyn Multiplexer, err: ConnError) -> ConnError {
    debug!(error = %err, "connection bootstrap failed");
    multiplexer.fail_all_responses(&err);
    if let Err(close_err) = transport.close().await {
        if !close_err.is_already_closed() {
            debug!(error = %close_err, "transport close after failed bootstrap");
        }
    }
    err
}
