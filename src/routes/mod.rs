//! API Routes
//!
//! - `/api/health` - Health check
//! - `/api/sessions` - Create a workflow session
//! - `/api/sessions/{id}` - Snapshot or close a session
//! - `/api/sessions/{id}/messages` - Send one user turn

pub mod health;
pub mod sessions;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = if state.config.server.cors_allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .server
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    }
    .allow_methods(Any)
    .allow_headers(Any);

    Router::new()
        .merge(health::router(state.clone()))
        .merge(sessions::router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
