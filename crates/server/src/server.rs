//! Server lifecycle: listener, router and graceful shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::http::{self, AppState};
use crate::session::SessionTable;

/// The terminal server: one session table served over HTTP.
pub struct Server {
    config: Config,
    table: Arc<SessionTable>,
}

impl Server {
    /// Creates a server from a validated configuration.
    pub fn new(config: Config) -> Self {
        let table = SessionTable::new(
            config.session.spawn_options(),
            config.session.max_sessions,
        );
        Self {
            config,
            table: Arc::new(table),
        }
    }

    /// Returns the session table.
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Serves on `listener` until `shutdown` resolves.
    ///
    /// On shutdown the listener stops accepting, every session is closed so
    /// that open terminal connections end, and in-flight requests get up to
    /// `server.shutdown_timeout_secs` to finish.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr: SocketAddr = listener.local_addr()?;
        let app = http::router(AppState::new(
            Arc::clone(&self.table),
            &self.config.session,
        ));

        let stop = CancellationToken::new();
        let serve_stop = stop.clone();
        let mut serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_stop.cancelled().await })
                .await
        });

        info!(address = %local_addr, "Terminal server listening");

        tokio::select! {
            result = &mut serve => {
                return result
                    .context("Server task failed")?
                    .context("Server error");
            }
            _ = shutdown => {}
        }

        info!("Shutting down terminal server");
        stop.cancel();
        self.table.shutdown().await;

        match tokio::time::timeout(self.config.shutdown_timeout(), serve).await {
            Ok(joined) => joined.context("Server task failed")?.context("Server error")?,
            Err(_) => warn!(
                timeout_secs = self.config.server.shutdown_timeout_secs,
                "Connections did not drain in time"
            ),
        }

        info!("Terminal server stopped");
        Ok(())
    }

    /// Binds and serves until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, wait_for_shutdown_signal()).await
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
