//! dockshell orchestrator library
//!
//! This library provisions a throwaway container per client connection and streams
//! an interactive shell inside it over a WebSocket.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod container;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod stream;
pub mod tty;

#[cfg(test)]
pub(crate) mod testing;

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    pub runtime: Arc<dyn container::ContainerRuntime>,
    pub tty_manager: Arc<tty::TtyManager>,
}

impl AppState {
    pub fn new(config: config::AppConfig, runtime: Arc<dyn container::ContainerRuntime>) -> Self {
        let settings = container::SessionSettings::from_config(&config);
        let tty_manager = Arc::new(tty::TtyManager::new(runtime.clone(), settings));

        Self {
            config,
            runtime,
            tty_manager,
        }
    }
}
