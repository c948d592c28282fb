//! API module for the dockshell orchestrator
//!
//! Provides endpoints for:
//! - The terminal WebSocket
//! - Session inspection
//! - Health checks and metrics

mod error;
mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub use error::ApiError;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))
        // Terminal WebSocket endpoint
        .route("/ws", get(handlers::terminal::terminal_websocket_handler))
        // API v1 routes
        .nest("/api/v1", api_v1_routes());

    if state.config.metrics.enabled {
        router = router.route(
            &state.config.metrics.path,
            get(crate::metrics::metrics_handler),
        );
    }

    router.with_state(state)
}

/// API v1 routes
fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(handlers::session::list_sessions))
        .route(
            "/sessions/:connection_id/status",
            get(handlers::session::get_status),
        )
}
