use std::time::{Duration, Instant};

use amqlink_conn::{connect, ConnectConfig, HandshakeConfig};
use amqlink_transport::{CertConfig, TlsMode};
use tracing::{debug, warn};

use crate::cmd::ProbeArgs;
use crate::exit::{conn_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{millis, print_probe, ChannelReport, OutputFormat, ProbeReport};

pub async fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    if args.channels == 0 && args.payload.is_some() {
        return Err(CliError::new(USAGE, "--payload needs at least one channel"));
    }

    let config = connect_config(&args, timeout);
    let broker = config.transport.authority();

    let started = Instant::now();
    let conn = connect(&config)
        .await
        .map_err(|err| conn_error("connect failed", err))?;
    let connect_ms = millis(started.elapsed());
    debug!(%broker, server_id = conn.server_id(), "connected");

    let mut channels = Vec::with_capacity(usize::from(args.channels));
    let mut reports = Vec::with_capacity(usize::from(args.channels));
    let mut failure = None;
    for _ in 0..args.channels {
        match conn.open_channel().await {
            Ok(channel) => channels.push(channel),
            Err(err) => {
                failure = Some(conn_error("channel open failed", err));
                break;
            }
        }
    }

    if failure.is_none() {
        for channel in &mut channels {
            let echo_ms = match &args.payload {
                Some(payload) => match echo(channel, payload, timeout).await {
                    Ok(elapsed) => Some(millis(elapsed)),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                },
                None => None,
            };
            reports.push(ChannelReport {
                id: channel.id().get(),
                echo_ms,
            });
        }
    }

    let closed_cleanly = match conn.close_default().await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "connection did not close cleanly");
            false
        }
    };

    if let Some(err) = failure {
        return Err(err);
    }

    let report = ProbeReport {
        broker,
        tls: args.tls,
        server_id: conn.server_id().to_string(),
        channel_max: conn.channel_max(),
        connect_ms,
        channels: reports,
        closed_cleanly,
    };
    print_probe(&report, format);

    Ok(if closed_cleanly { SUCCESS } else { FAILURE })
}

fn connect_config(args: &ProbeArgs, timeout: Duration) -> ConnectConfig {
    let mut config = ConnectConfig::new(args.host.clone(), args.port)
        .with_connect_timeout(timeout)
        .with_handshake(HandshakeConfig::default().with_timeout(timeout))
        .with_close_timeout(timeout);

    if args.tls {
        config = config.with_tls(TlsMode::Tls {
            cert_config: args.ca_file.clone().map(CertConfig::with_ca_file),
            sni_override: args.sni.clone(),
        });
    }
    config
}

async fn echo(
    channel: &mut amqlink_conn::LogicalChannel,
    payload: &str,
    timeout: Duration,
) -> CliResult<Duration> {
    let started = Instant::now();
    channel
        .send(payload.as_bytes().to_vec())
        .await
        .map_err(|err| conn_error("send failed", err))?;

    match tokio::time::timeout(timeout, channel.recv()).await {
        Ok(Some(reply)) if reply.as_ref() == payload.as_bytes() => Ok(started.elapsed()),
        Ok(Some(_)) => Err(CliError::new(
            FAILURE,
            format!("channel {} echoed a different payload", channel.id()),
        )),
        Ok(None) => Err(CliError::new(
            FAILURE,
            format!("channel {} closed before echo", channel.id()),
        )),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no echo on channel {} within {timeout:?}", channel.id()),
        )),
    }
}

fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported timeout unit: {unit}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn args(host: &str) -> ProbeArgs {
        ProbeArgs {
            host: host.to_string(),
            port: 5671,
            channels: 2,
            payload: None,
            tls: false,
            sni: None,
            ca_file: None,
            timeout: "5s".to_string(),
        }
    }

    #[test]
    fn parse_timeout_seconds() {
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_timeout_millis() {
        assert_eq!(parse_timeout("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        assert!(parse_timeout("0s").is_err());
        assert!(parse_timeout("bad").is_err());
    }

    #[test]
    fn plain_config_by_default() {
        let config = connect_config(&args("broker"), Duration::from_secs(3));
        assert_eq!(config.transport.authority(), "broker:5671");
        assert_eq!(config.transport.tls, TlsMode::Plain);
        assert_eq!(config.handshake.timeout, Duration::from_secs(3));
        assert_eq!(config.close_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn tls_config_carries_ca_and_sni() {
        let mut probe = args("10.0.0.5");
        probe.tls = true;
        probe.sni = Some("broker.internal".to_string());
        probe.ca_file = Some(PathBuf::from("/etc/amqlink/ca.pem"));

        let config = connect_config(&probe, Duration::from_secs(3));
        assert_eq!(
            config.transport.tls,
            TlsMode::Tls {
                cert_config: Some(CertConfig::with_ca_file("/etc/amqlink/ca.pem")),
                sni_override: Some("broker.internal".to_string()),
            }
        );
    }
}
