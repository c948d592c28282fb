//! Prometheus metrics export
//!
//! Provides metrics endpoint for monitoring session lifecycle and stream throughput

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::AppState;

/// Prometheus metrics recorder
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize metrics system
pub fn init_metrics() -> anyhow::Result<()> {
    METRICS_HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder())?;
    Ok(())
}

/// Record a session entering Starting
pub fn record_session_started() {
    counter!("dockshell_sessions_started_total").increment(1);
}

/// Record a session entering Failed
pub fn record_session_failed(reason: &str) {
    counter!("dockshell_sessions_failed_total", "reason" => reason.to_string()).increment(1);
}

/// Record a session reaching Stopped
pub fn record_session_stopped() {
    counter!("dockshell_sessions_stopped_total").increment(1);
}

/// Record a shell entering or leaving Streaming
pub fn record_streaming(delta: f64) {
    gauge!("dockshell_streaming_sessions").increment(delta);
}

/// Record output forwarded to a client
pub fn record_output_bytes(stream: &str, bytes: u64) {
    counter!("dockshell_output_bytes_total", "stream" => stream.to_string()).increment(bytes);
}

/// Record an input line written to a shell
pub fn record_input_line() {
    counter!("dockshell_input_lines_total").increment(1);
}

/// Record a teardown step that failed
pub fn record_teardown_failure(step: &str) {
    counter!("dockshell_teardown_failures_total", "step" => step.to_string()).increment(1);
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    gauge!("dockshell_active_connections").set(state.tty_manager.count().await as f64);

    let metrics = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
}
