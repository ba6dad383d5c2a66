use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ChannelReport {
    pub id: u16,
    /// Round trip of the echo payload, when one was sent.
    pub echo_ms: Option<f64>,
}

#[derive(Serialize, Debug)]
pub struct ProbeReport {
    pub broker: String,
    pub tls: bool,
    pub server_id: String,
    pub channel_max: u16,
    pub connect_ms: f64,
    pub channels: Vec<ChannelReport>,
    pub closed_cleanly: bool,
}

pub fn print_probe(report: &ProbeReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut summary = Table::new();
            summary
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["BROKER", "TLS", "SERVER ID", "CHANNEL MAX", "CONNECT"])
                .add_row(vec![
                    report.broker.clone(),
                    report.tls.to_string(),
                    report.server_id.clone(),
                    report.channel_max.to_string(),
                    format!("{:.2}ms", report.connect_ms),
                ]);
            println!("{summary}");

            if !report.channels.is_empty() {
                let mut channels = Table::new();
                channels
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["CHANNEL", "ECHO"]);
                for channel in &report.channels {
                    channels.add_row(vec![channel.id.to_string(), echo_cell(channel.echo_ms)]);
                }
                println!("{channels}");
            }
        }
        OutputFormat::Pretty => {
            println!("Probe:");
            println!("  Broker:      {}", report.broker);
            println!("  TLS:         {}", report.tls);
            println!("  Server ID:   {}", report.server_id);
            println!("  Channel max: {}", report.channel_max);
            println!("  Connect:     {:.2}ms", report.connect_ms);
            let ids = report
                .channels
                .iter()
                .map(|c| c.id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            println!("  Channels:    {ids}");
            println!("  Closed:      {}", if report.closed_cleanly { "cleanly" } else { "with errors" });
        }
    }
}

pub fn print_listening(addr: &str, channel_max: u16, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "listening": addr, "channel_max": channel_max })
        ),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("listening on {addr} (channel max {channel_max})");
        }
    }
}

pub fn millis(duration: std::time::Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

fn echo_cell(echo_ms: Option<f64>) -> String {
    match echo_ms {
        Some(ms) => format!("{ms:.2}ms"),
        None => "-".to_string(),
    }
}
