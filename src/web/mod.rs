//! Web server exposing the pull-metrics and health endpoints.

mod handlers;

use crate::config::ServerConfig;
use crate::db::WriterHandle;
use crate::metrics::MetricsCollector;
use crate::registry::Registry;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub metrics: Arc<MetricsCollector>,
    pub writer: WriterHandle,
    pub started: Instant,
}

/// HTTP server for the metrics scrape surface.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        registry: Registry,
        metrics: Arc<MetricsCollector>,
        writer: WriterHandle,
    ) -> Self {
        Self {
            config,
            state: AppState {
                registry,
                metrics,
                writer,
                started: Instant::now(),
            },
        }
    }

    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/metrics", get(handlers::handle_metrics))
            .route("/health", get(handlers::handle_health))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown signal fires.
    pub async fn start(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }
}
