//! TLS client wrapping.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::CertConfig;
use crate::error::{Result, TransportError};

/// Build a TLS connector from an optional trust configuration.
///
/// Without a configuration the bundled webpki roots are trusted.
pub fn build_connector(cert_config: Option<&CertConfig>) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    let mut alpn = Vec::new();

    match cert_config {
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        Some(config) => {
            if config.include_webpki_roots {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            for path in &config.ca_files {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|err| TransportError::Certificate {
                            path: path.clone(),
                            message: err.to_string(),
                        })?;
                }
            }
            alpn = config
                .alpn
                .iter()
                .map(|protocol| protocol.as_bytes().to_vec())
                .collect();
        }
    }

    let mut tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls_config.alpn_protocols = alpn;

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Resolve the name presented for SNI and certificate verification.
pub fn server_name(host: &str, sni_override: Option<&str>) -> Result<ServerName<'static>> {
    let name = sni_override.unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|_| TransportError::InvalidServerName(name.to_string()))
}

/// Negotiate TLS over an already connected TCP stream.
pub async fn wrap(
    connector: &TlsConnector,
    name: ServerName<'static>,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    debug!(server_name = ?name, "starting tls handshake");
    connector
        .connect(name, stream)
        .await
        .map_err(TransportError::Tls)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|err| TransportError::Certificate {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| TransportError::Certificate {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TransportError::Certificate {
            path: path.to_path_buf(),
            message: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}
