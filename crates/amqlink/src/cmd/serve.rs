use amqlink_conn::{BrokerConfig, HandshakeConfig, LoopbackBroker};
use tracing::info;

use crate::cmd::ServeArgs;
use crate::exit::{conn_error, io_error, CliResult, SUCCESS};
use crate::output::{print_listening, OutputFormat};

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = BrokerConfig {
        handshake: HandshakeConfig::default().with_channel_max(args.channel_max),
        ..BrokerConfig::default()
    }
    .with_server_id(args.server_id);

    let broker = LoopbackBroker::bind(args.bind.as_str())
        .await
        .map_err(|err| conn_error("bind failed", err))?
        .with_config(config);
    let addr = broker
        .local_addr()
        .map_err(|err| conn_error("bind failed", err))?;

    print_listening(&addr.to_string(), args.channel_max, format);

    tokio::select! {
        result = broker.run() => {
            result.map_err(|err| conn_error("accept failed", err))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| io_error("signal handler setup failed", err))?;
            info!("interrupted; shutting down");
        }
    }

    Ok(SUCCESS)
}
