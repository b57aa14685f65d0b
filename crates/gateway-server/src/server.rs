//! HTTP server implementation.

use crate::{routes::create_router, state::AppState};
use gateway_config::ServerConfig;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

/// HTTP server for the gateway
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a new server
    #[must_use]
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Run the server until Ctrl+C or SIGTERM
    ///
    /// # Errors
    /// Returns error if the server fails to start or encounters a fatal error
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server with a custom shutdown signal
    ///
    /// In-flight requests get `graceful_shutdown_timeout` to finish once the
    /// signal fires.
    ///
    /// # Errors
    /// Returns error if the server fails to start
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self
            .config
            .socket_addr()
            .parse()
            .map_err(|e| ServerError::Config(format!("Invalid listen address: {e}")))?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            environment = %self.config.environment,
            "Starting HTTP server"
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        info!(address = %addr, "Server listening");

        let tasks = self.state.spawn_background_tasks();
        let router = create_router(self.state);

        let draining = Arc::new(Notify::new());
        let signal_draining = Arc::clone(&draining);
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            signal_draining.notify_one();
        });

        let grace = self.config.graceful_shutdown_timeout;
        let result = tokio::select! {
            result = serve.into_future() => result.map_err(|e| ServerError::Serve(e.to_string())),
            () = async {
                draining.notified().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(
                    timeout_ms = grace.as_millis(),
                    "Graceful shutdown timed out, dropping open connections"
                );
                Ok(())
            }
        };

        for task in tasks {
            task.abort();
        }

        info!("Server shutdown complete");
        result
    }
}

/// Server error type
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address
    #[error("Failed to bind to address: {0}")]
    Bind(String),
    /// Server error during operation
    #[error("Server error: {0}")]
    Serve(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Shutdown signal handler
///
/// # Panics
/// Panics if signal handlers cannot be installed (should not happen on supported platforms)
#[allow(clippy::expect_used)]
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::GatewayConfig;

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let mut config = GatewayConfig::default();
        config.server.host = "not an address".to_string();
        let state = AppState::builder().config(config.clone()).build().unwrap();

        let err = Server::new(config.server, state)
            .run_until(async {})
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_server() {
        let mut config = GatewayConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let state = AppState::builder().config(config.clone()).build().unwrap();

        let result = Server::new(config.server, state).run_until(async {}).await;
        assert!(result.is_ok());
    }
}
