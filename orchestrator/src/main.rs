//! dockshell orchestrator - interactive container shells over WebSocket
//!
//! This is the main entry point for the dockshell orchestrator service.
//! It provisions one container per terminal connection and streams its shell.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::HeaderName;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use dockshell_orchestrator::api::create_router;
use dockshell_orchestrator::config::AppConfig;
use dockshell_orchestrator::container::{CliRuntime, ContainerRuntime};
use dockshell_orchestrator::logging::init_logging;
use dockshell_orchestrator::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config.log_level, &config.log_dir)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting dockshell orchestrator"
    );

    // Initialize metrics system
    if config.metrics.enabled {
        dockshell_orchestrator::metrics::init_metrics()?;
        info!(path = %config.metrics.path, "Prometheus metrics initialized");
    }

    // Locate the container runtime
    let runtime = CliRuntime::new(config.runtime.binary.as_deref());
    match runtime.version().await {
        Some(version) => info!(binary = %runtime.binary(), %version, "Container runtime found"),
        None => warn!(
            binary = %runtime.binary(),
            "Container runtime not reachable; sessions will fail until it is"
        ),
    }

    // Create shared application state
    let state = Arc::new(AppState::new(config.clone(), Arc::new(runtime)));

    // Build the router with all routes and middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    let app = create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "Listening on");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");

    if config.stop_sessions_on_shutdown {
        warn!(
            connections = state.tty_manager.count().await,
            "Stopping all session containers..."
        );
        state.tty_manager.shutdown_all().await;
    }

    info!("dockshell orchestrator stopped");
    Ok(())
}

/// Handle shutdown signals gracefully
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
