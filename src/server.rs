//! Listener setup and the per-connection serve loop.

use std::sync::Arc;

use thiserror::Error;
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::{
    config::Config,
    handlers::registry::{Registry, RegistryError},
    metrics::MetricsRegistry,
    pipeline::Pipeline,
    transport::{milter::MilterConnection, smtp::SmtpProxy},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid handler configuration: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to listen on address: {0}")]
    Listen(std::io::Error),
    #[error("no milter_listen or smtp_listen address configured")]
    NoListeners,
}

pub struct GatewayServer {
    config: Arc<Config>,
    registry: Arc<Registry>,
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
}

impl GatewayServer {
    pub fn new(config: Arc<Config>, shutdown: CancellationToken) -> Result<Self, ServerError> {
        let registry = Arc::new(Registry::from_config(&config)?);
        let metrics = MetricsRegistry::new();
        registry.register_metrics(&metrics);

        Ok(Self {
            config,
            registry,
            metrics,
            shutdown,
        })
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    fn pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::new(
            self.config.clone(),
            self.registry.clone(),
            self.metrics.clone(),
        );
        pipeline
            .ctx
            .deadlines
            .set_overall(std::time::Duration::from_secs(self.config.overall_timeout));
        pipeline
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        let milter_listener = match &self.config.milter_listen {
            Some(address) => Some(
                TcpListener::bind(address)
                    .await
                    .map_err(ServerError::Listen)?,
            ),
            None => None,
        };
        let smtp_listener = match &self.config.smtp_listen {
            Some(address) => Some(
                TcpListener::bind(address)
                    .await
                    .map_err(ServerError::Listen)?,
            ),
            None => None,
        };

        if milter_listener.is_none() && smtp_listener.is_none() {
            return Err(ServerError::NoListeners);
        }

        if let Some(listener) = &milter_listener {
            info!(
                "milter server on {}",
                listener.local_addr().map_err(ServerError::Listen)?
            );
        }
        if let Some(listener) = &smtp_listener {
            info!(
                "smtp proxy on {}",
                listener.local_addr().map_err(ServerError::Listen)?
            );
        }

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down gateway");
                    return Ok(());
                }
                result = accept(&milter_listener), if milter_listener.is_some() => {
                    match result {
                        Ok((mut stream, peer_addr)) => {
                            trace!(peer = %peer_addr, "new milter connection");
                            let connection = MilterConnection::new(self.pipeline());
                            tokio::spawn(async move {
                                match connection.handle(&mut stream).await {
                                    Ok(true) => debug!("milter connection asked for worker recycle"),
                                    Ok(false) => {}
                                    Err(e) => error!("failed to handle milter connection: {e}"),
                                }
                            });
                        }
                        Err(e) => error!("failed to accept milter connection: {e}"),
                    }
                }
                result = accept(&smtp_listener), if smtp_listener.is_some() => {
                    match result {
                        Ok((mut stream, peer_addr)) => {
                            trace!(peer = %peer_addr, "new smtp connection");
                            let proxy = SmtpProxy::new(
                                self.pipeline(),
                                self.config.hostname.clone(),
                                self.config.smtp_downstream.clone(),
                            );
                            tokio::spawn(async move {
                                match proxy.handle(&mut stream, peer_addr).await {
                                    Ok(true) => debug!("smtp connection asked for worker recycle"),
                                    Ok(false) => {}
                                    Err(e) => error!("failed to handle smtp connection: {e}"),
                                }
                            });
                        }
                        Err(e) => error!("failed to accept smtp connection: {e}"),
                    }
                }
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("gateway server error: {e:?}");
            }
        });
    }
}

async fn accept(
    listener: &Option<TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        // Guarded out by the `if` on the select arm.
        None => std::future::pending().await,
    }
}
