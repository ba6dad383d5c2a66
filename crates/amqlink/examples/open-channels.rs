//! Open a few channels against an in-process loopback broker, echo a
//! payload on each, then close everything.
//!
//! Run with:
//!   cargo run --example open-channels

use amqlink::conn::{BrokerConfig, LoopbackBroker};
use amqlink::{connect, ConnectConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let broker = LoopbackBroker::bind("127.0.0.1:0")
        .await?
        .with_config(BrokerConfig::default().with_channel_max(8));
    let addr = broker.local_addr()?;
    tokio::spawn(broker.run());

    let conn = connect(&ConnectConfig::new(addr.ip().to_string(), addr.port())).await?;
    eprintln!(
        "[client] connected to {} (channel max {})",
        conn.server_id(),
        conn.channel_max()
    );

    let mut channels = Vec::new();
    for _ in 0..3 {
        channels.push(conn.open_channel().await?);
    }

    for channel in &mut channels {
        let message = format!("hello from channel {}", channel.id());
        channel.send(message.into_bytes()).await?;
        if let Some(reply) = channel.recv().await {
            eprintln!(
                "[client] channel={} echo={}",
                channel.id(),
                String::from_utf8_lossy(&reply)
            );
        }
    }

    for channel in channels {
        channel.close().await?;
    }
    conn.close("done", 200).await?;
    eprintln!("[client] state={}", conn.state().as_str());
    Ok(())
}
