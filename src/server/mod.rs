//! HTTP server
//!
//! One listener serves the OAuth endpoints, health and metrics, and the
//! bearer-protected `/mcp` endpoint. Background tasks (limiter cleanup,
//! credential reaping, client cache sweeps) share one cancellation token
//! and are drained within `server.shutdown_timeout`.

pub mod mcp;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::federation::Manager;
use crate::metrics::FacadeMetrics;
use crate::oauth::AuthorizationServer;
use crate::{Error, Result};
use router::{AppState, create_router};

/// The MCP Kubernetes server
pub struct Server {
    config: Config,
    oauth: Option<Arc<AuthorizationServer>>,
    federation: Option<Arc<Manager>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Build the authorization server and federation manager from `config`
    pub async fn new(config: Config) -> Result<Self> {
        let oauth = if config.oauth.enabled {
            Some(Arc::new(
                AuthorizationServer::from_config(&config.oauth, Arc::new(FacadeMetrics)).await?,
            ))
        } else {
            None
        };

        let federation = if config.federation.enabled {
            let manager = Manager::from_config(&config.federation, Arc::new(FacadeMetrics)).await?;
            Some(Arc::new(manager))
        } else {
            None
        };

        Ok(Self {
            config,
            oauth,
            federation,
            shutdown: CancellationToken::new(),
        })
    }

    /// Serve until SIGINT/SIGTERM, then drain
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let addr = SocketAddr::new(
            server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server.port,
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if let Some(oauth) = &self.oauth {
            tasks.extend(oauth.spawn_maintenance(&self.shutdown));
        }
        if let Some(manager) = &self.federation {
            manager.start();
        }

        let state = Arc::new(AppState {
            oauth: self.oauth.clone(),
            federation: self.federation.clone(),
            shutdown: self.shutdown.clone(),
            max_body_size: server.max_body_size,
            request_timeout: server.write_timeout,
            allowed_origins: server.allowed_origins.clone(),
            hsts: server.hsts,
            #[cfg(feature = "metrics")]
            prometheus: crate::metrics::install_prometheus(),
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;

        info!(version = env!("CARGO_PKG_VERSION"), host = %server.host, port = server.port, "Listening");
        match &self.oauth {
            Some(oauth) => info!(
                issuer = oauth.issuer(),
                encrypted = oauth.is_encrypted(),
                "OAuth enabled: /mcp requires a bearer token"
            ),
            None => warn!("OAuth disabled: /mcp is open to all requests"),
        }
        match &self.federation {
            Some(manager) => info!(
                workload_auth_mode = manager.stats().workload_auth_mode,
                "Multi-cluster federation enabled"
            ),
            None => info!("Multi-cluster federation disabled"),
        }

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(self.shutdown.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.drain(tasks).await;
        Ok(())
    }

    async fn drain(&self, tasks: Vec<JoinHandle<()>>) {
        info!("Shutting down...");
        self.shutdown.cancel();
        let grace = self.config.server.shutdown_timeout;
        let drained = tokio::time::timeout(grace, async {
            if let Some(manager) = &self.federation {
                manager.close().await;
            }
            futures::future::join_all(tasks).await;
        })
        .await;
        if drained.is_err() {
            warn!(grace_secs = grace.as_secs(), "Background tasks did not stop within the shutdown timeout");
        }
    }
}

/// Resolves on SIGINT or SIGTERM, or when `shutdown` is cancelled elsewhere
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Shutdown signal received"),
        () = terminate => info!("Shutdown signal received"),
        () = shutdown.cancelled() => {},
    }
    shutdown.cancel();
}
