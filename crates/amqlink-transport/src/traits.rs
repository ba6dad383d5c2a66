use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::Result;

/// A connected broker stream implementing `AsyncRead + AsyncWrite`.
///
/// This is the fundamental I/O type returned by [`crate::connect`].
/// Plain connections wrap a TCP stream; TLS connections wrap the rustls
/// client stream negotiated on top of it.
pub struct TransportStream {
    inner: TransportStreamInner,
    peer_addr: SocketAddr,
}

enum TransportStreamInner {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TransportStream {
    pub(crate) fn plain(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            inner: TransportStreamInner::Plain(stream),
            peer_addr,
        }
    }

    pub(crate) fn tls(stream: TlsStream<TcpStream>, peer_addr: SocketAddr) -> Self {
        Self {
            inner: TransportStreamInner::Tls(Box::new(stream)),
            peer_addr,
        }
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the stream is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner, TransportStreamInner::Tls(_))
    }
}

impl From<TcpStream> for TransportStream {
    /// Wrap an already connected TCP stream (e.g. one accepted by a listener).
    fn from(stream: TcpStream) -> Self {
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        Self::plain(stream, peer_addr)
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            TransportStreamInner::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportStreamInner::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            TransportStreamInner::Plain(_) => "tcp",
            TransportStreamInner::Tls(_) => "tls",
        };
        f.debug_struct("TransportStream")
            .field("type", &kind)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// A live transport as seen by the connection core.
///
/// The core never reads or writes through this seam; it only observes
/// liveness and drives teardown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// True while the underlying socket is open.
    fn is_active(&self) -> bool;

    /// Close the transport.
    ///
    /// Fails with [`crate::TransportError::AlreadyClosed`] when the transport
    /// was already torn down (by an earlier close, the peer, or an I/O error).
    async fn close(&self) -> Result<()>;

    /// Resolves once the transport's own teardown has completed, whatever
    /// caused it.
    async fn closed(&self);
}
