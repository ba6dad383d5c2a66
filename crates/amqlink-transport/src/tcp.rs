use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::{TlsMode, TransportConfig};
use crate::error::{Result, TransportError};
use crate::tls;
use crate::traits::TransportStream;

/// Open the byte connection described by `config`.
///
/// Resolution, the TCP connect and (for [`TlsMode::Tls`]) the TLS
/// negotiation together are bounded by `config.connect_timeout`. TLS
/// trust material is loaded before any socket is opened so configuration
/// errors surface without touching the network.
pub async fn connect(config: &TransportConfig) -> Result<TransportStream> {
    let tls = match &config.tls {
        TlsMode::Plain => None,
        TlsMode::Tls {
            cert_config,
            sni_override,
        } => {
            let connector = tls::build_connector(cert_config.as_ref())?;
            let name = tls::server_name(&config.host, sni_override.as_deref())?;
            Some((connector, name))
        }
    };

    let attempt = async {
        let (stream, peer_addr) = connect_tcp(&config.host, config.port).await?;
        match tls {
            None => Ok::<_, TransportError>(TransportStream::plain(stream, peer_addr)),
            Some((connector, name)) => {
                let stream = tls::wrap(&connector, name, stream).await?;
                Ok(TransportStream::tls(stream, peer_addr))
            }
        }
    };

    let stream = timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| TransportError::Timeout(config.connect_timeout))??;

    info!(
        peer = %stream.peer_addr(),
        tls = stream.is_tls(),
        "transport connected"
    );
    Ok(stream)
}

/// Try every resolved address in order; the last failure is reported.
async fn connect_tcp(host: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match connect_addr(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(source) => {
                debug!(%addr, error = %source, "connect attempt failed");
                last_err = Some(TransportError::Connect { addr, source });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TransportError::Resolve {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
    }))
}

fn socket_for(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = socket_for(addr)?;
    socket.connect(addr).await
}
