use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes;
use crate::state::AppState;

/// Webhook + internal HTTP server built on axum.
pub struct FlowServer {
    state: Arc<AppState>,
}

impl FlowServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run the server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/api/health", get(routes::health))
            // Platform webhook surface
            .route("/webhook", get(routes::verify_webhook))
            .route("/webhook", post(routes::receive_webhook))
            // Operator tooling
            .route(
                "/internal/triggers/{id}/process",
                post(routes::process_trigger),
            )
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone());

        let bind = self.state.config.server.bind.clone();
        let listener = TcpListener::bind(&bind).await?;
        info!(bind = %bind, "Server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Server shut down");
        Ok(())
    }
}
