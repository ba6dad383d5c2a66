use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod probe;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a broker, open channels and print negotiated metadata.
    Probe(ProbeArgs),
    /// Run the loopback broker.
    Serve(ServeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Probe(args) => probe::run(args, format).await,
        Command::Serve(args) => serve::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Broker host.
    #[arg(env = "AMQLINK_HOST", default_value = "localhost")]
    pub host: String,
    /// Broker port.
    #[arg(long, env = "AMQLINK_PORT", default_value_t = amqlink_transport::DEFAULT_PORT)]
    pub port: u16,
    /// Number of channels to open.
    #[arg(long, default_value_t = 1)]
    pub channels: u16,
    /// Send this payload on every channel and wait for the echo.
    #[arg(long)]
    pub payload: Option<String>,
    /// Connect over TLS.
    #[arg(long)]
    pub tls: bool,
    /// Server name for SNI instead of the host.
    #[arg(long, requires = "tls")]
    pub sni: Option<String>,
    /// PEM file with CA certificates to trust instead of the webpki roots.
    #[arg(long, value_name = "FILE", requires = "tls")]
    pub ca_file: Option<PathBuf>,
    /// Connect and handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:5672")]
    pub bind: String,
    /// Channel maximum offered to clients (0 = protocol ceiling).
    #[arg(long, default_value_t = amqlink_frame::DEFAULT_CHANNEL_MAX)]
    pub channel_max: u16,
    /// Identifier reported to clients.
    #[arg(long, default_value = "amqlink-loopback")]
    pub server_id: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
