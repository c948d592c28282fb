//! Configuration module for the dockshell orchestrator
//!
//! Supports configuration via:
//! - YAML/TOML config files
//! - Environment variables (with DOCKSHELL_ prefix)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Tear down every live session when the orchestrator shuts down
    #[serde(default = "default_true")]
    pub stop_sessions_on_shutdown: bool,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Terminal streaming settings
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Container runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Explicit path to the docker/podman binary (looked up on PATH when unset)
    #[serde(default)]
    pub binary: Option<String>,

    /// Image every session container is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Placeholder command that keeps the container alive
    #[serde(default = "default_keepalive_command")]
    pub keepalive_command: Vec<String>,

    /// Interactive command attached to the container
    #[serde(default = "default_shell_command")]
    pub shell_command: Vec<String>,

    /// Prefix for generated container names
    #[serde(default = "default_name_prefix")]
    pub container_name_prefix: String,

    /// Upper bound for container creation (0 = unbounded)
    #[serde(default)]
    pub create_timeout_seconds: u64,

    /// Upper bound for shell attach (0 = unbounded)
    #[serde(default)]
    pub attach_timeout_seconds: u64,
}

/// Line terminator expected by the client terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    Crlf,
    Lf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Crlf => "\r\n",
            LineEnding::Lf => "\n",
        }
    }
}

/// Terminal streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Line terminator written to the client
    #[serde(default)]
    pub line_ending: LineEnding,

    /// Line sent to the shell right after it is attached
    #[serde(default = "default_greeting")]
    pub greeting_command: Option<String>,

    /// Bytes requested per pipe read
    #[serde(default = "default_read_buffer")]
    pub read_buffer_size: usize,

    /// Delay before re-reading a pipe that hit end-of-stream while the shell is alive
    #[serde(default = "default_eof_poll_ms")]
    pub eof_poll_interval_ms: u64,

    /// How long teardown waits for the shell and forwarders before aborting them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Buffered server->client events per connection
    #[serde(default = "default_output_capacity")]
    pub output_channel_capacity: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_image() -> String {
    "kalilinux/kali-rolling".to_string()
}

fn default_keepalive_command() -> Vec<String> {
    vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
}

fn default_shell_command() -> Vec<String> {
    vec!["/bin/bash".to_string()]
}

fn default_name_prefix() -> String {
    "dockshell".to_string()
}

fn default_greeting() -> Option<String> {
    Some("echo 'Hello from container'".to_string())
}

fn default_read_buffer() -> usize {
    4096
}

fn default_eof_poll_ms() -> u64 {
    50
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_output_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            image: default_image(),
            keepalive_command: default_keepalive_command(),
            shell_command: default_shell_command(),
            container_name_prefix: default_name_prefix(),
            create_timeout_seconds: 0,
            attach_timeout_seconds: 0,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::default(),
            greeting_command: default_greeting(),
            read_buffer_size: default_read_buffer(),
            eof_poll_interval_ms: default_eof_poll_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            output_channel_capacity: default_output_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            stop_sessions_on_shutdown: true,
            runtime: RuntimeConfig::default(),
            terminal: TerminalConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/dockshell").required(false))
            .add_source(config::File::with_name("/etc/dockshell/config").required(false));

        Self::build(builder)
    }

    /// Load configuration from an explicit file, still honouring environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let builder = config::Config::builder().add_source(config::File::from(path));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(builder.build().context("Failed to read configuration files")?)
            // Override with environment variables (DOCKSHELL_ prefix);
            // command lists are space separated, e.g. DOCKSHELL__RUNTIME__SHELL_COMMAND="/bin/sh -l"
            .add_source(
                config::Environment::with_prefix("DOCKSHELL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("runtime.keepalive_command")
                    .with_list_parse_key("runtime.shell_command"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.runtime.image.trim().is_empty() {
            anyhow::bail!("Container image cannot be empty");
        }

        if self.runtime.keepalive_command.is_empty() {
            anyhow::bail!("Keepalive command cannot be empty");
        }

        if self.runtime.shell_command.is_empty() {
            anyhow::bail!("Shell command cannot be empty");
        }

        if self.terminal.read_buffer_size == 0 {
            anyhow::bail!("Read buffer size cannot be 0");
        }

        if self.terminal.output_channel_capacity == 0 {
            anyhow::bail!("Output channel capacity cannot be 0");
        }

        Ok(())
    }
}
