//! Web server module.

mod handlers;

use crate::config::{ConfigHandle, ServerConfig};
use crate::db::Store;
use crate::monitor::Registry;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<ConfigHandle>,
    pub store: Arc<Store>,
}

/// Read-only snapshot API.
pub struct Server {
    bind: String,
    state: AppState,
}

impl Server {
    pub fn new(config: &ServerConfig, state: AppState) -> Self {
        Self {
            bind: format!("{}:{}", config.host, config.http_port),
            state,
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/servers/", get(handlers::handle_get_servers))
            .route("/pings/{id}", get(handlers::handle_get_pings))
            .route("/results/{id}", get(handlers::handle_get_results))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = self.routes();
        let listener = tokio::net::TcpListener::bind(&self.bind).await?;

        tracing::info!("Web server listening on {}", listener.local_addr()?);
        axum::serve(listener, router).await?;

        Ok(())
    }
}
