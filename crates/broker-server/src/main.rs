use anyhow::{Context, Result};
use broker_helpers::{logging, shutdown};
use broker_server::config::Config;
use broker_server::app::AppState;
use broker_server::core::{run_tcp_server, spawn_clock};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging("broker_server=info,tokio=warn", "BROKER_LOG", "broker-server");

    let config = Config::load().context("failed to load configuration")?;
    let options = config.to_broker_options().context("invalid configuration")?;
    let state = AppState::new(options);

    info!("broker starting: listen={}", config.listen);

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    tokio::spawn(spawn_clock(
        state.core.clone(),
        state.connection_rate_limiter.clone(),
        config.clock_tick(),
        state.shutdown.clone(),
    ));

    run_tcp_server(&config.listen, state).await
}
