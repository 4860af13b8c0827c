//! API Server
//!
//! Serves the REST surface until shutdown is signalled.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use super::rest::RestRouter;
use crate::controlplane::Orchestrator;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Deadline handed to every lifecycle request
    pub request_timeout_secs: u64,
    /// Max request body size
    pub max_body_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            request_timeout_secs: 30,
            max_body_size: 1024 * 1024,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            shutdown_tx,
        }
    }

    fn router(&self) -> axum::Router {
        RestRouter::new(self.orchestrator.clone())
            .with_request_timeout(Duration::from_secs(self.config.request_timeout_secs))
            .with_max_body_size(self.config.max_body_size)
            .build()
    }

    /// Bind and serve until `shutdown` is called
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("REST listener has no address: {}", e)))?;
        info!(
            "REST API listening on {}{}",
            addr,
            self.orchestrator.config().api_base_path()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::controlplane::backends::BackendFactory;
    use crate::store::InMemoryStore;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let orchestrator = Orchestrator::new(
            Arc::new(OrchestratorConfig::default()),
            Arc::new(InMemoryStore::new()),
            BackendFactory::new(),
        )
        .unwrap();
        let server = Arc::new(ApiServer::new(ApiServerConfig::default(), orchestrator));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve(listener).await });
        // Subscription happens inside serve; give it a moment
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
