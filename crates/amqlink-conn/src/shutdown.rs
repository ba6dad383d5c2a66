//! Connection close: gate, protocol close, socket close, aggregation.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connection::{CloseOutcome, ConnectionInner};
use crate::error::{CombinedCloseError, ConnError, Result};

/// Close `inner`, or wait for the close already in progress.
pub(crate) async fn close(inner: &Arc<ConnectionInner>, reason: &str, code: u16) -> Result<()> {
    let mut outcome = inner.close_outcome.subscribe();

    let won = {
        let _serial = inner.serial.lock().await;
        inner.state.try_begin_shutdown()
    };

    if won {
        // Runs detached so the close completes even if this caller goes away.
        let task_inner = Arc::clone(inner);
        let reason = reason.to_string();
        tokio::spawn(async move {
            let result = teardown(&task_inner, &reason, code).await;
            task_inner.close_outcome.send_replace(Some(result));
        });
    } else {
        debug!(connection = inner.id, "close already in progress");
    }

    let published = outcome
        .wait_for(Option::is_some)
        .await
        .map_err(|_| ConnError::ConnectionClosed)?
        .clone();
    match published {
        Some(Err(err)) => Err(ConnError::Close(err)),
        Some(Ok(())) | None => Ok(()),
    }
}

async fn teardown(inner: &ConnectionInner, reason: &str, code: u16) -> CloseOutcome {
    debug!(connection = inner.id, code, reason, "closing connection");

    let broker_error = match protocol_close(inner, reason, code).await {
        Ok(()) => None,
        Err(err) => {
            warn!(connection = inner.id, error = %err, "protocol close failed");
            Some(err)
        }
    };

    let transport_error = match inner.transport.close().await {
        Ok(()) => None,
        Err(err) if err.is_already_closed() => None,
        Err(err) => {
            warn!(connection = inner.id, error = %err, "transport close failed");
            Some(err)
        }
    };

    // Wakes channel opens still waiting on the broker.
    inner
        .multiplexer
        .fail_all_responses(&ConnError::ConnectionClosed);
    if !inner.state.finish_shutdown() {
        warn!(connection = inner.id, "connection was not shutting down");
    }
    inner.registry().clear();
    debug!(connection = inner.id, "connection closed");

    if broker_error.is_none() && transport_error.is_none() {
        Ok(())
    } else {
        Err(CombinedCloseError::new(broker_error, transport_error))
    }
}

async fn protocol_close(inner: &ConnectionInner, reason: &str, code: u16) -> Result<()> {
    let close = inner.multiplexer.close(reason, code);
    match inner.close_timeout {
        Some(limit) => timeout(limit, close)
            .await
            .map_err(|_| ConnError::Timeout(limit))?,
        None => close.await,
    }
}
