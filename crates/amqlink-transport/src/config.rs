use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 5672;

/// Default bound on resolution + connect + TLS negotiation.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Trust configuration for TLS connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertConfig {
    /// PEM files holding additional trusted CA certificates.
    pub ca_files: Vec<PathBuf>,
    /// Also trust the bundled webpki root set.
    pub include_webpki_roots: bool,
    /// ALPN protocols offered during negotiation.
    pub alpn: Vec<String>,
}

impl CertConfig {
    /// Trust only the given CA file.
    pub fn with_ca_file(path: impl Into<PathBuf>) -> Self {
        Self {
            ca_files: vec![path.into()],
            include_webpki_roots: false,
            alpn: Vec::new(),
        }
    }
}

/// Whether the byte stream is wrapped in TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Unencrypted TCP.
    #[default]
    Plain,
    /// TLS over TCP.
    Tls {
        /// Trust configuration; `None` uses the default webpki roots.
        cert_config: Option<CertConfig>,
        /// Server name used for SNI instead of the target host.
        sni_override: Option<String>,
    },
}

impl TlsMode {
    /// TLS with default trust roots and SNI from the target host.
    pub fn tls() -> Self {
        Self::Tls {
            cert_config: None,
            sni_override: None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }
}

/// Where and how to open the byte connection.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Target host name or address.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Bound on the whole connect attempt.
    pub connect_timeout: Duration,
    /// Plain or TLS.
    pub tls: TlsMode,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// `host:port` for diagnostics.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: TlsMode::Plain,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("authority", &self.authority())
            .field("connect_timeout", &self.connect_timeout)
            .field("tls", &self.tls.is_tls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_local_broker() {
        let config = TransportConfig::default();
        assert_eq!(config.authority(), "localhost:5672");
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.tls, TlsMode::Plain);
    }

    #[test]
    fn builder_overrides() {
        let config = TransportConfig::new("broker.internal", 5671)
            .with_connect_timeout(Duration::from_millis(250))
            .with_tls(TlsMode::tls());
        assert_eq!(config.authority(), "broker.internal:5671");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert!(config.tls.is_tls());
    }

    #[test]
    fn debug_omits_trust_details() {
        let config = TransportConfig::default().with_tls(TlsMode::Tls {
            cert_config: Some(CertConfig::with_ca_file("/etc/ssl/private-ca.pem")),
            sni_override: None,
        });
        let debug = format!("{config:?}");
        assert!(debug.contains("localhost:5672"));
        assert!(!debug.contains("private-ca.pem"));
    }
}
