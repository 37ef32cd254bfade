//! Local HTTP/WebSocket API for the presentation layer.

mod auth;
mod connections;
mod error;
mod routes;

pub use auth::SessionUser;
pub use connections::ConnectionManager;
pub use error::{AppError, Result};

use crate::{Config, Tally};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub tally: Arc<Tally>,
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    /// Build the state and start forwarding bus events to `/events`
    /// connections.
    pub fn new(tally: Arc<Tally>) -> Self {
        let connections = ConnectionManager::new_shared();
        connections.forward(tally.events());
        Self {
            config: Arc::new(tally.config().clone()),
            tally,
            connections,
        }
    }
}

/// The complete API with tracing and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
