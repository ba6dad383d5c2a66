//! Per-connection I/O task.
//!
//! The task owns the framed stream. Decoded frames go to a
//! [`FrameHandler`]; frames queued by the multiplexer go to the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqlink_frame::{Frame, FrameCodec};
use amqlink_transport::{Transport, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ConnError;
use crate::multiplexer::FrameHandler;

/// Upper bound on flushing and shutting down the write half.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Install `codec` and `handler` on `stream` and start the I/O task.
///
/// `handler.on_active()` runs inside the task before the first read.
pub fn spawn<S>(
    stream: S,
    codec: FrameCodec,
    handler: Arc<dyn FrameHandler>,
    outbound: mpsc::Receiver<Frame>,
) -> SocketTransport
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let active = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();
    let (closed_tx, closed_rx) = watch::channel(false);

    tokio::spawn(run(
        Framed::new(stream, codec),
        handler,
        outbound,
        shutdown.clone(),
        Arc::clone(&active),
        closed_tx,
    ));

    SocketTransport {
        active,
        closing: AtomicBool::new(false),
        shutdown,
        closed: closed_rx,
    }
}

async fn run<S>(
    framed: Framed<S, FrameCodec>,
    handler: Arc<dyn FrameHandler>,
    mut outbound: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
    active: Arc<AtomicBool>,
    closed: watch::Sender<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = framed.split();
    handler.on_active();

    let error: Option<ConnError> = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break None,
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => handler.on_frame(frame),
                Some(Err(err)) => break Some(err.into()),
                None => break None,
            },
            queued = outbound.recv() => match queued {
                Some(frame) => {
                    trace!(channel = frame.channel, kind = ?frame.kind, "frame out");
                    if let Err(err) = sink.send(frame).await {
                        break Some(err.into());
                    }
                }
                None => break None,
            },
        }
    };

    active.store(false, Ordering::SeqCst);
    handler.on_inactive(error.as_ref());

    match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "error shutting down write half"),
        Err(_) => debug!("timed out shutting down write half"),
    }

    debug!(?error, "connection pipeline stopped");
    closed.send_replace(true);
}

/// [`Transport`] backed by the pipeline task.
#[derive(Debug)]
pub struct SocketTransport {
    active: Arc<AtomicBool>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Transport for SocketTransport {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn close(&self) -> amqlink_transport::Result<()> {
        if !self.is_active() || self.closing.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyClosed);
        }
        self.shutdown.cancel();
        self.closed().await;
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // The task publishes `true` before dropping the sender.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl FrameHandler for Recorder {
        fn on_active(&self) {
            self.events.lock().unwrap().push("active".to_string());
        }

        fn on_frame(&self, frame: Frame) {
            self.events
                .lock()
                .unwrap()
                .push(format!("frame:{}", frame.channel));
        }

        fn on_inactive(&self, error: Option<&ConnError>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("inactive:{}", error.is_some()));
        }
    }

    fn wire(frame: &Frame) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        amqlink_frame::encode_frame(frame, &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn delivers_frames_and_reports_peer_eof() {
        let (local, mut remote) = duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = mpsc::channel(8);
        let transport = spawn(local, FrameCodec::default(), recorder.clone(), rx);

        remote
            .write_all(&wire(&Frame::body(7, Bytes::from_static(b"x"))))
            .await
            .unwrap();
        drop(remote);

        transport.closed().await;
        assert!(!transport.is_active());
        assert_eq!(
            recorder.events(),
            vec!["active", "frame:7", "inactive:false"]
        );
        assert!(transport.close().await.unwrap_err().is_already_closed());
    }

    #[tokio::test]
    async fn writes_queued_frames() {
        let (local, mut remote) = duplex(4096);
        let (tx, rx) = mpsc::channel(8);
        let transport = spawn(local, FrameCodec::default(), Arc::new(Recorder::default()), rx);

        let frame = Frame::method(0, Bytes::from_static(b"{}"));
        tx.send(frame.clone()).await.unwrap();

        let expected = wire(&frame);
        let mut buf = vec![0u8; expected.len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        assert!(transport.is_active());
    }

    #[tokio::test]
    async fn close_is_effective_once() {
        let (local, _remote) = duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = mpsc::channel(8);
        let transport = spawn(local, FrameCodec::default(), recorder.clone(), rx);

        transport.close().await.unwrap();
        assert!(!transport.is_active());
        assert!(transport.close().await.unwrap_err().is_already_closed());
        assert_eq!(recorder.events().last().map(String::as_str), Some("inactive:false"));
    }

    #[tokio::test]
    async fn malformed_input_ends_the_stream_with_an_error() {
        let (local, mut remote) = duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let (_tx, rx) = mpsc::channel(8);
        let transport = spawn(local, FrameCodec::default(), recorder.clone(), rx);

        remote.write_all(&[9, 0, 0, 0, 0, 0, 0, 0xCE]).await.unwrap();
        transport.closed().await;
        assert_eq!(recorder.events(), vec!["active", "inactive:true"]);
    }
}
