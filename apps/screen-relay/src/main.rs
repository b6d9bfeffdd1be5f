use anyhow::Result;
use clap::Parser;
use screen_relay::{server, telemetry::Telemetry, Cli, ServerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        session_timeout_secs = config.main.idle_timeout.as_secs(),
        pointer_timeout_ms = config.pointer.idle_timeout.as_millis() as u64,
        "starting screen-relay server"
    );

    server::run(config, telemetry.metrics_handle()).await
}
