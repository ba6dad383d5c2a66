#![cfg(feature = "cli")]

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("port probe should bind")
        .local_addr()
        .expect("port probe should have an address")
        .port()
}

fn amqlink() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_amqlink"));
    cmd.env_remove("AMQLINK_HOST")
        .env_remove("AMQLINK_PORT")
        .arg("--log-level")
        .arg("error");
    cmd
}

struct Server(Child);

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Start `amqlink serve` and wait for its listening line.
fn serve(port: u16, channel_max: u16) -> Server {
    let mut child = amqlink()
        .arg("--format")
        .arg("json")
        .arg("serve")
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--channel-max")
        .arg(channel_max.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");

    let stdout = child.stdout.take().expect("serve stdout should be piped");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("serve should print its address");
    let listening: serde_json::Value =
        serde_json::from_str(&line).expect("listening line should be json");
    assert_eq!(
        listening["listening"].as_str(),
        Some(format!("127.0.0.1:{port}").as_str())
    );

    Server(child)
}

#[test]
fn probe_against_loopback_broker() {
    let port = free_port();
    let _server = serve(port, 16);

    let output = amqlink()
        .arg("--format")
        .arg("json")
        .arg("probe")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--channels")
        .arg("3")
        .arg("--payload")
        .arg("ping")
        .output()
        .expect("probe should run");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("probe should emit json");
    assert_eq!(report["server_id"], "amqlink-loopback");
    assert_eq!(report["channel_max"], 16);
    assert_eq!(report["closed_cleanly"], true);
    let channels = report["channels"]
        .as_array()
        .expect("channels should be an array");
    assert_eq!(channels.len(), 3);
    assert_eq!(channels[0]["id"], 1);
    assert!(channels[2]["echo_ms"].is_number());
}

#[test]
fn probe_beyond_channel_max_fails_with_usage() {
    let port = free_port();
    let _server = serve(port, 2);

    let output = amqlink()
        .arg("probe")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--channels")
        .arg("3")
        .output()
        .expect("probe should run");

    assert_eq!(output.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("too many open channels"), "stderr: {stderr}");
}

#[test]
fn probe_refused_connection_fails() {
    let port = free_port();

    let output = amqlink()
        .arg("probe")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string())
        .arg("--timeout")
        .arg("2s")
        .output()
        .expect("probe should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("connect failed"), "stderr: {stderr}");
}

#[test]
fn probe_port_from_environment() {
    let port = free_port();
    let _server = serve(port, 8);

    let output = amqlink()
        .env("AMQLINK_HOST", "127.0.0.1")
        .env("AMQLINK_PORT", port.to_string())
        .arg("--format")
        .arg("json")
        .arg("probe")
        .output()
        .expect("probe should run");

    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("probe should emit json");
    assert_eq!(report["broker"], format!("127.0.0.1:{port}"));
}

#[test]
fn version_prints_package_version() {
    let output = amqlink()
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("amqlink {}", env!("CARGO_PKG_VERSION"))
    );
}
