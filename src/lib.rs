use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod address;
pub mod config;
pub mod disposition;
pub mod dns;
pub mod handlers;
pub mod headers;
pub mod metrics;
pub mod objects;
pub mod pipeline;
pub mod server;
pub mod symbols;
pub mod timeout;
pub mod transport;

pub use config::Config;
pub use server::{GatewayServer, ServerError};

pub fn init_tracing(config: &Config) {
    let default_filter = if config.debug {
        format!("{}=debug,info", env!("CARGO_CRATE_NAME"))
    } else {
        format!("{}=info,warn", env!("CARGO_CRATE_NAME"))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .with(
            config
                .logtoerr
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();
}

/// Build and start the gateway on its configured listeners.
pub fn run_gateway(config: Config, shutdown: CancellationToken) -> Result<(), ServerError> {
    let server = GatewayServer::new(Arc::new(config), shutdown)?;
    server.spawn();
    Ok(())
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
