use std::time::Duration;

use amqlink_frame::channel::negotiate_channel_max;
use amqlink_frame::{DEFAULT_CHANNEL_MAX, DEFAULT_MAX_PAYLOAD};

use crate::control::ControlMessage;
use crate::error::{ConnError, Result};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_SERVER_ID_LEN: usize = 128;

/// What the multiplexer's handshake signal resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The peer accepted the connection.
    Connected {
        /// Negotiated channel maximum.
        channel_max: u16,
        /// Peer-reported identifier.
        server_id: String,
    },
    /// Anything else: refusal, protocol mismatch, unexpected method.
    Rejected { reason: String },
}

/// Configuration for handshake negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Protocol name exchanged in `start`/`tune`.
    pub protocol_name: String,
    /// Local protocol version (`<major>.<minor>`).
    pub protocol_version: String,
    /// Channel maximum proposed to the peer. 0 proposes the protocol ceiling.
    pub channel_max: u16,
    /// How long to wait for the peer's handshake reply.
    pub timeout: Duration,
    /// Maximum frame payload accepted on this connection.
    pub max_frame_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_name: "amqlink".to_string(),
            protocol_version: "0.9".to_string(),
            channel_max: DEFAULT_CHANNEL_MAX,
            timeout: Duration::from_secs(10),
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl HandshakeConfig {
    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the local settings before anything is sent.
    pub fn validate(&self) -> Result<()> {
        validate_protocol_name(&self.protocol_name)?;
        validate_version(&self.protocol_version)?;
        Ok(())
    }
}

/// Client greeting for `config`.
pub fn start_message(config: &HandshakeConfig) -> ControlMessage {
    ControlMessage::Start {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        channel_max: config.channel_max,
    }
}

/// Client side: interpret the first connection-level method from the peer.
pub fn evaluate_reply(config: &HandshakeConfig, reply: ControlMessage) -> HandshakeOutcome {
    match reply {
        ControlMessage::Tune {
            protocol,
            version,
            channel_max,
            server_id,
        } => match check_tune(config, &protocol, &version, &server_id) {
            Ok(()) => HandshakeOutcome::Connected {
                channel_max: negotiate_channel_max(config.channel_max, channel_max),
                server_id,
            },
            Err(err) => HandshakeOutcome::Rejected {
                reason: err.to_string(),
            },
        },
        ControlMessage::Refuse { reason } => HandshakeOutcome::Rejected { reason },
        ControlMessage::Close { code, reason } | ControlMessage::Error { code, reason } => {
            HandshakeOutcome::Rejected {
                reason: format!("peer closed during handshake ({code}): {reason}"),
            }
        }
        other => HandshakeOutcome::Rejected {
            reason: format!("unexpected '{}' during handshake", other.name()),
        },
    }
}

/// Server side: validate a client greeting.
///
/// Returns the negotiated channel maximum, or the reason to send in a
/// `refuse`.
pub fn accept_start(
    config: &HandshakeConfig,
    start: &ControlMessage,
) -> std::result::Result<u16, String> {
    let ControlMessage::Start {
        protocol,
        version,
        channel_max,
    } = start
    else {
        return Err(format!("expected 'start', got '{}'", start.name()));
    };

    validate_protocol_name(protocol).map_err(|err| err.to_string())?;
    validate_version(version).map_err(|err| err.to_string())?;

    if protocol != &config.protocol_name {
        return Err(format!(
            "unknown protocol '{}' (expected '{}')",
            protocol, config.protocol_name
        ));
    }
    if !is_version_compatible(version, &config.protocol_version).map_err(|err| err.to_string())? {
        return Err(format!(
            "incompatible version '{}' (server '{}')",
            version, config.protocol_version
        ));
    }

    Ok(negotiate_channel_max(*channel_max, config.channel_max))
}

/// Server acceptance carrying the negotiated limits.
pub fn tune_message(config: &HandshakeConfig, server_id: &str, channel_max: u16) -> ControlMessage {
    ControlMessage::Tune {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        channel_max,
        server_id: server_id.to_string(),
    }
}

fn check_tune(config: &HandshakeConfig, protocol: &str, version: &str, server_id: &str) -> Result<()> {
    validate_protocol_name(protocol)?;
    validate_version(version)?;
    validate_server_id(server_id)?;

    if protocol != config.protocol_name {
        return Err(ConnError::InvalidHandshakeResponse(format!(
            "unknown protocol '{}' (expected '{}')",
            protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&config.protocol_version, version)? {
        return Err(ConnError::InvalidHandshakeResponse(format!(
            "incompatible version '{}' (local '{}')",
            version, config.protocol_version
        )));
    }
    Ok(())
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(ConnError::InvalidHandshakeResponse(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(ConnError::InvalidHandshakeResponse(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_server_id(server_id: &str) -> Result<()> {
    if server_id.is_empty() || server_id.len() > MAX_SERVER_ID_LEN {
        return Err(ConnError::InvalidHandshakeResponse(format!(
            "invalid server_id length: {}",
            server_id.len()
        )));
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |detail: &str| {
        ConnError::InvalidHandshakeResponse(format!("invalid version '{version}': {detail}"))
    };

    let mut parts = version.split('.');
    let major = parts.next().ok_or_else(|| invalid("missing major"))?;
    let minor = parts.next().ok_or_else(|| invalid("missing minor"))?;
    if parts.next().is_some() {
        return Err(invalid("expected '<major>.<minor>'"));
    }

    let major = major
        .parse::<u16>()
        .map_err(|_| invalid("non-numeric major"))?;
    let minor = minor
        .parse::<u16>()
        .map_err(|_| invalid("non-numeric minor"))?;

    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tune(channel_max: u16) -> ControlMessage {
        ControlMessage::Tune {
            protocol: "amqlink".to_string(),
            version: "0.9".to_string(),
            channel_max,
            server_id: "broker-1".to_string(),
        }
    }

    #[test]
    fn tune_negotiates_smaller_channel_max() {
        let config = HandshakeConfig::default();
        assert_eq!(
            evaluate_reply(&config, tune(128)),
            HandshakeOutcome::Connected {
                channel_max: 128,
                server_id: "broker-1".to_string(),
            }
        );

        let config = HandshakeConfig::default().with_channel_max(16);
        assert!(matches!(
            evaluate_reply(&config, tune(0)),
            HandshakeOutcome::Connected { channel_max: 16, .. }
        ));
    }

    #[test]
    fn refuse_and_close_are_rejections() {
        let config = HandshakeConfig::default();
        assert_eq!(
            evaluate_reply(
                &config,
                ControlMessage::Refuse {
                    reason: "access refused".to_string()
                }
            ),
            HandshakeOutcome::Rejected {
                reason: "access refused".to_string()
            }
        );
        assert!(matches!(
            evaluate_reply(&config, ControlMessage::close(320, "forced")),
            HandshakeOutcome::Rejected { .. }
        ));
        assert!(matches!(
            evaluate_reply(&config, ControlMessage::ChannelOpenOk),
            HandshakeOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn tune_with_wrong_protocol_is_rejected() {
        let config = HandshakeConfig::default();
        let reply = ControlMessage::Tune {
            protocol: "other".to_string(),
            version: "0.9".to_string(),
            channel_max: 10,
            server_id: "b".to_string(),
        };
        match evaluate_reply(&config, reply) {
            HandshakeOutcome::Rejected { reason } => assert!(reason.contains("unknown protocol")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn tune_with_newer_minor_version_is_rejected() {
        let config = HandshakeConfig::default();
        let reply = ControlMessage::Tune {
            protocol: "amqlink".to_string(),
            version: "0.10".to_string(),
            channel_max: 10,
            server_id: "b".to_string(),
        };
        assert!(matches!(
            evaluate_reply(&config, reply),
            HandshakeOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn server_accepts_matching_start() {
        let server = HandshakeConfig::default().with_channel_max(64);
        let start = start_message(&HandshakeConfig::default());
        let channel_max = accept_start(&server, &start).unwrap();
        assert_eq!(channel_max, 64);
        assert_eq!(
            tune_message(&server, "broker-7", channel_max),
            ControlMessage::Tune {
                protocol: "amqlink".to_string(),
                version: "0.9".to_string(),
                channel_max: 64,
                server_id: "broker-7".to_string(),
            }
        );
    }

    #[test]
    fn server_refuses_mismatched_start() {
        let server = HandshakeConfig::default();
        let start = ControlMessage::Start {
            protocol: "amqlink".to_string(),
            version: "1.0".to_string(),
            channel_max: 0,
        };
        let reason = accept_start(&server, &start).unwrap_err();
        assert!(reason.contains("incompatible version"));

        let reason = accept_start(&server, &ControlMessage::CloseOk).unwrap_err();
        assert!(reason.contains("expected 'start'"));
    }

    #[test]
    fn parse_version_rejects_garbage() {
        assert!(parse_version("1").is_err());
        assert!(parse_version("1.2.3").is_err());
        assert!(parse_version("a.b").is_err());
        assert_eq!(parse_version("0.9").unwrap(), (0, 9));
    }

    #[test]
    fn config_validation() {
        assert!(HandshakeConfig::default().validate().is_ok());
        let config = HandshakeConfig {
            protocol_version: "nine".to_string(),
            ..HandshakeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
