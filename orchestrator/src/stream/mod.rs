//! Stream pump between a client terminal and an attached shell
//!
//! Two independent forwarders copy the shell's stdout and stderr to the client
//! as bytes arrive, while client lines are written to the shell's stdin. Each
//! stream keeps its own order; stdout and stderr are not ordered against each other.

pub mod encoding;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LineEnding, TerminalConfig};
use crate::container::runtime::{ProcessInput, ProcessOutput, ShellPipes};
use crate::metrics;

pub use encoding::{normalize_input, normalize_output, Utf8Decoder};

/// Which shell stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Text produced by the shell, line endings already normalised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: String,
}

/// How an attached shell went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The shell exited by itself
    Exited(Option<i32>),
    /// The shell was killed during teardown
    Killed,
}

/// Push-style destination for shell output, supplied by the transport layer
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one chunk; returns false once the client side has gone away
    async fn send_output(&self, chunk: OutputChunk) -> bool;
}

#[async_trait]
impl OutputSink for mpsc::Sender<OutputChunk> {
    async fn send_output(&self, chunk: OutputChunk) -> bool {
        self.send(chunk).await.is_ok()
    }
}

/// Errors from writing client input to the shell
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PumpError {
    #[error("no attached shell process")]
    ProcessAbsent,

    #[error("StdinWriteFailed: {0}")]
    StdinWriteFailed(String),
}

/// Pump tuning
#[derive(Debug, Clone)]
pub struct PumpOptions {
    pub line_ending: LineEnding,
    pub read_buffer_size: usize,
    pub eof_poll_interval: Duration,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self::from(&TerminalConfig::default())
    }
}

impl From<&TerminalConfig> for PumpOptions {
    fn from(config: &TerminalConfig) -> Self {
        Self {
            line_ending: config.line_ending,
            read_buffer_size: config.read_buffer_size.max(1),
            eof_poll_interval: Duration::from_millis(config.eof_poll_interval_ms.max(1)),
        }
    }
}

/// Duplex engine for one attached shell
pub struct StreamPump {
    stdin: Mutex<Option<ProcessInput>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    cancel: CancellationToken,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamPump {
    /// Spawn the stdout and stderr forwarders; returns immediately
    pub fn start(
        pipes: ShellPipes,
        exit: watch::Receiver<Option<ProcessExit>>,
        cancel: CancellationToken,
        sink: Arc<dyn OutputSink>,
        options: PumpOptions,
    ) -> Self {
        let ShellPipes {
            stdin,
            stdout,
            stderr,
        } = pipes;

        let forwarders = [(StreamKind::Stdout, stdout), (StreamKind::Stderr, stderr)]
            .into_iter()
            .map(|(kind, reader)| {
                tokio::spawn(forward(
                    kind,
                    reader,
                    sink.clone(),
                    exit.clone(),
                    cancel.clone(),
                    options.clone(),
                ))
            })
            .collect();

        Self {
            stdin: Mutex::new(Some(stdin)),
            exit,
            cancel,
            forwarders: Mutex::new(forwarders),
        }
    }

    /// Whether the shell is known to be gone
    pub fn has_exited(&self) -> bool {
        self.cancel.is_cancelled() || self.exit.borrow().is_some()
    }

    /// Normalise a client line and write it, newline-terminated, to the shell's stdin
    pub async fn submit_input(&self, line: &str) -> Result<(), PumpError> {
        if self.has_exited() {
            debug!("Dropping input for exited shell");
            return Err(PumpError::ProcessAbsent);
        }

        let normalized = normalize_input(line);
        debug!(raw = ?line, sanitized = ?normalized, "Writing input to shell");

        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or(PumpError::ProcessAbsent)?;

        let payload = format!("{}\n", normalized);
        let written = async {
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                metrics::record_input_line();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Error writing to shell stdin");
                Err(PumpError::StdinWriteFailed(e.to_string()))
            }
        }
    }

    /// Whether any forwarder is still running
    pub async fn is_running(&self) -> bool {
        self.forwarders
            .lock()
            .await
            .iter()
            .any(|handle| !handle.is_finished())
    }

    /// Stop forwarding: close stdin, give forwarders `grace` to finish, then abort stragglers.
    ///
    /// If the shell already exited on its own the forwarders are left to drain the
    /// remaining output first; otherwise they are cancelled straight away.
    pub async fn shutdown(&self, grace: Duration) {
        if self.exit.borrow().is_none() {
            self.cancel.cancel();
        }

        self.stdin.lock().await.take();

        let handles = std::mem::take(&mut *self.forwarders.lock().await);
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Output forwarder did not stop in time; aborting");
                handle.abort();
            }
        }

        self.cancel.cancel();
    }
}

/// Copy one shell stream to the client until the shell is gone or teardown cancels us
async fn forward(
    kind: StreamKind,
    mut reader: ProcessOutput,
    sink: Arc<dyn OutputSink>,
    mut exit: watch::Receiver<Option<ProcessExit>>,
    cancel: CancellationToken,
    options: PumpOptions,
) {
    let mut buf = vec![0u8; options.read_buffer_size];
    let mut decoder = Utf8Decoder::default();

    debug!(stream = kind.as_str(), "Streaming shell output");

    loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(stream = kind.as_str(), "Forwarder cancelled");
                return;
            }

            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                if exit.borrow().is_some() {
                    break;
                }

                // End of stream while the shell is still alive: not termination yet
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return,

                    changed = exit.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }

                    _ = tokio::time::sleep(options.eof_poll_interval) => {}
                }
            }
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if text.is_empty() {
                    continue;
                }

                if !deliver(kind, &text, &sink, options.line_ending).await {
                    debug!(stream = kind.as_str(), "Client sink closed");
                    return;
                }
            }
            Err(e) => {
                warn!(stream = kind.as_str(), error = %e, "Error reading shell output");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        deliver(kind, &rest, &sink, options.line_ending).await;
    }

    info!(stream = kind.as_str(), "Shell output stream ended");
}

async fn deliver(
    kind: StreamKind,
    text: &str,
    sink: &Arc<dyn OutputSink>,
    line_ending: LineEnding,
) -> bool {
    let data = normalize_output(text, line_ending);
    metrics::record_output_bytes(kind.as_str(), data.len() as u64);

    sink.send_output(OutputChunk { stream: kind, data }).await
}
