use anyhow::Context;
use authmilter::{init_tracing, run_gateway, shutdown_signal, Config};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AUTHMILTER_CONFIG").ok());

    let config = match config_path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => Config::default(),
    };

    init_tracing(&config);

    let shutdown = CancellationToken::new();
    run_gateway(config, shutdown.clone())?;

    shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    // give connections the opportunity to finish
    tokio::time::sleep(Duration::from_secs(2)).await;

    Ok(())
}
