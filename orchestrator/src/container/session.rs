//! Container session state machine
//!
//! One session owns one container and at most one attached shell:
//!
//! ```text
//! Uninitialized -> Starting -> Ready -> AttachingShell -> Streaming
//!                     |                      |               |
//!                     v                      v               v
//!                   Failed                 Failed        Stopping -> Stopped
//! ```
//!
//! `Failed` and `Stopped` are terminal; a finished session is discarded and a new one
//! is created for the next `begin()`.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::metrics;
use crate::stream::{OutputSink, ProcessExit, PumpError, PumpOptions, StreamPump};

use super::runtime::{ContainerRuntime, RuntimeError, ShellProcess, TeardownReport};

/// Maximum number of state transitions kept per session
const MAX_TRANSITION_HISTORY: usize = 32;

/// Session state enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Starting,
    Ready,
    AttachingShell,
    Streaming,
    Stopping,
    Stopped,
    Failed(String),
}

impl SessionState {
    pub fn tag(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::AttachingShell => "attaching_shell",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Stopped or Failed: nothing further can happen to this session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }

    fn default_detail(&self) -> String {
        match self {
            SessionState::Uninitialized => "Initializing...".to_string(),
            SessionState::Starting => "Starting container...".to_string(),
            SessionState::Ready => "Container is ready".to_string(),
            SessionState::AttachingShell => "Attaching shell...".to_string(),
            SessionState::Streaming => "Shell attached".to_string(),
            SessionState::Stopping => "Stopping container...".to_string(),
            SessionState::Stopped => "Container stopped and removed".to_string(),
            SessionState::Failed(reason) => format!("Error: {}", reason),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Consistent (state, detail) pair, always written together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub detail: String,
}

impl StatusSnapshot {
    fn new(state: SessionState, detail: Option<String>) -> Self {
        let detail = detail.unwrap_or_else(|| state.default_detail());
        Self { state, detail }
    }

    /// Human readable status line shown to clients
    pub fn status_line(&self) -> String {
        self.detail.clone()
    }
}

/// One entry of the transition history
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub state: &'static str,
    pub at: DateTime<Utc>,
}

/// Errors from driving a session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("session was terminated while {0}")]
    Terminated(&'static str),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Input(#[from] PumpError),
}

/// Per-session settings derived from the application config
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub image: String,
    pub keepalive_command: Vec<String>,
    pub shell_command: Vec<String>,
    pub container_name_prefix: String,
    pub create_timeout: Option<Duration>,
    pub attach_timeout: Option<Duration>,
    pub greeting_command: Option<String>,
    pub shutdown_grace: Duration,
    pub pump: PumpOptions,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let bound = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        Self {
            image: config.runtime.image.clone(),
            keepalive_command: config.runtime.keepalive_command.clone(),
            shell_command: config.runtime.shell_command.clone(),
            container_name_prefix: config.runtime.container_name_prefix.clone(),
            create_timeout: bound(config.runtime.create_timeout_seconds),
            attach_timeout: bound(config.runtime.attach_timeout_seconds),
            greeting_command: config.terminal.greeting_command.clone(),
            shutdown_grace: Duration::from_millis(config.terminal.shutdown_grace_ms),
            pump: PumpOptions::from(&config.terminal),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The attached shell: pump, cancellation and exit signal
struct AttachedShell {
    pump: Arc<StreamPump>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
    supervisor: JoinHandle<()>,
}

struct SessionInner {
    status: StatusSnapshot,
    container_id: Option<String>,
    shell: Option<AttachedShell>,
    stop_requested: bool,
    transitions: VecDeque<StateTransition>,
}

/// One client's container and attached shell
pub struct ContainerSession {
    /// Unique session ID
    pub session_id: Uuid,

    /// Container name passed to the runtime
    pub container_name: String,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    runtime: Arc<dyn ContainerRuntime>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl ContainerSession {
    /// Create a new, uninitialized session
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SessionSettings) -> Self {
        let session_id = Uuid::new_v4();
        let container_name = format!("{}_{}", settings.container_name_prefix, session_id.simple());
        let status = StatusSnapshot::new(SessionState::Uninitialized, None);
        let (status_tx, _) = watch::channel(status.clone());

        let mut transitions = VecDeque::with_capacity(MAX_TRANSITION_HISTORY);
        transitions.push_back(StateTransition {
            state: status.state.tag(),
            at: Utc::now(),
        });

        Self {
            session_id,
            container_name,
            created_at: Utc::now(),
            runtime,
            settings,
            inner: Mutex::new(SessionInner {
                status,
                container_id: None,
                shell: None,
                stop_requested: false,
                transitions,
            }),
            status_tx,
        }
    }

    /// Current status snapshot
    pub async fn status(&self) -> StatusSnapshot {
        self.inner.lock().await.status.clone()
    }

    /// Receive every status change
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Get container ID
    pub async fn container_id(&self) -> Option<String> {
        self.inner.lock().await.container_id.clone()
    }

    /// Whether a shell process is currently attached
    pub async fn has_process(&self) -> bool {
        self.inner.lock().await.shell.is_some()
    }

    /// Get the transition history, oldest first
    pub async fn transitions(&self) -> Vec<StateTransition> {
        self.inner.lock().await.transitions.iter().cloned().collect()
    }

    fn transition(&self, inner: &mut SessionInner, state: SessionState, detail: Option<String>) {
        info!(
            session_id = %self.session_id,
            from = %inner.status.state,
            to = %state,
            "Session state transition"
        );

        if state.is_terminal() {
            // Release ownership even if the underlying cleanup partially failed
            if let Some(shell) = inner.shell.take() {
                shell.cancel.cancel();
            }
            inner.container_id = None;
        }

        if inner.transitions.len() >= MAX_TRANSITION_HISTORY {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(StateTransition {
            state: state.tag(),
            at: Utc::now(),
        });

        inner.status = StatusSnapshot::new(state, detail);
        self.status_tx.send_replace(inner.status.clone());
    }

    fn fail(&self, inner: &mut SessionInner, err: &RuntimeError) {
        warn!(session_id = %self.session_id, error = %err, "Session failed");
        metrics::record_session_failed(err.kind());
        self.transition(inner, SessionState::Failed(err.to_string()), None);
    }

    fn invalid(operation: &'static str, state: &SessionState) -> SessionError {
        SessionError::InvalidState {
            operation,
            state: state.tag(),
        }
    }

    /// Provision the container: Uninitialized -> Starting -> Ready (or Failed)
    pub async fn begin(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.status.state != SessionState::Uninitialized {
                return Err(Self::invalid("begin", &inner.status.state));
            }
            self.transition(&mut inner, SessionState::Starting, None);
        }
        metrics::record_session_started();

        info!(
            session_id = %self.session_id,
            container_name = %self.container_name,
            image = %self.settings.image,
            "Creating container"
        );

        let result = bounded(
            self.settings.create_timeout,
            self.runtime.create_container(
                &self.container_name,
                &self.settings.image,
                &self.settings.keepalive_command,
            ),
            RuntimeError::CreateFailed,
        )
        .await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(container_id) => {
                info!(session_id = %self.session_id, container_id = %container_id, "Container ready");
                inner.container_id = Some(container_id);
                self.transition(&mut inner, SessionState::Ready, None);

                if inner.stop_requested {
                    drop(inner);
                    info!(session_id = %self.session_id, "Stop was requested during startup");
                    self.terminate().await;
                    return Err(SessionError::Terminated("starting"));
                }
                Ok(())
            }
            Err(err) => {
                self.fail(&mut inner, &err);
                Err(err.into())
            }
        }
    }

    /// Attach the interactive shell and start the pump: Ready -> AttachingShell -> Streaming
    pub async fn attach(self: &Arc<Self>, sink: Arc<dyn OutputSink>) -> Result<(), SessionError> {
        let container_id = {
            let mut inner = self.inner.lock().await;
            let container_id = match (&inner.status.state, &inner.container_id) {
                (SessionState::Ready, Some(id)) => id.clone(),
                (state, _) => return Err(Self::invalid("attach", state)),
            };
            self.transition(&mut inner, SessionState::AttachingShell, None);
            container_id
        };

        let result = bounded(
            self.settings.attach_timeout,
            self.runtime
                .attach_shell(&container_id, &self.settings.shell_command),
            RuntimeError::AttachFailed,
        )
        .await;

        let mut attached = match result {
            Ok(attached) => attached,
            Err(err) => {
                {
                    let mut inner = self.inner.lock().await;
                    if inner.status.state != SessionState::AttachingShell {
                        return Err(SessionError::Terminated("attaching shell"));
                    }
                    self.fail(&mut inner, &err);
                }

                // The container outlives a failed attach; remove it so it does not leak
                let report = self.runtime.stop_and_remove(&container_id).await;
                if !report.is_clean() {
                    warn!(
                        session_id = %self.session_id,
                        container_id = %container_id,
                        errors = %report.summary(),
                        "Cleanup after failed attach was incomplete"
                    );
                }
                return Err(err.into());
            }
        };

        let pump = {
            let mut inner = self.inner.lock().await;
            if inner.status.state != SessionState::AttachingShell {
                drop(inner);
                warn!(session_id = %self.session_id, "Session torn down while attaching; killing shell");
                if let Err(e) = attached.process.kill().await {
                    warn!(session_id = %self.session_id, error = %e, "Failed to kill late shell");
                }
                return Err(SessionError::Terminated("attaching shell"));
            }

            let cancel = CancellationToken::new();
            let (exit_tx, exit_rx) = watch::channel(None);

            let pump = Arc::new(StreamPump::start(
                attached.pipes,
                exit_rx.clone(),
                cancel.clone(),
                sink,
                self.settings.pump.clone(),
            ));

            let supervisor = tokio::spawn(supervise(
                attached.process,
                cancel.clone(),
                exit_tx,
                Arc::downgrade(self),
                self.session_id,
            ));

            inner.shell = Some(AttachedShell {
                pump: pump.clone(),
                cancel,
                exit: exit_rx,
                supervisor,
            });
            self.transition(&mut inner, SessionState::Streaming, None);
            metrics::record_streaming(1.0);
            pump
        };

        if let Some(greeting) = &self.settings.greeting_command {
            if let Err(e) = pump.submit_input(greeting).await {
                warn!(session_id = %self.session_id, error = %e, "Failed to send greeting");
            }
        }

        Ok(())
    }

    /// Forward one client line to the attached shell
    pub async fn submit_input(&self, line: &str) -> Result<(), SessionError> {
        let pump = {
            let inner = self.inner.lock().await;
            inner.shell.as_ref().map(|shell| shell.pump.clone())
        };

        match pump {
            Some(pump) => pump.submit_input(line).await.map_err(SessionError::from),
            None => {
                debug!(session_id = %self.session_id, "Input received with no attached shell");
                Err(PumpError::ProcessAbsent.into())
            }
        }
    }

    /// Tear down shell and container; reaches Stopped exactly once.
    ///
    /// Returns the teardown report for the call that performed the teardown and
    /// `None` for every call that had nothing left to do.
    pub async fn terminate(&self) -> Option<TeardownReport> {
        let (container_id, shell) = {
            let mut inner = self.inner.lock().await;
            match inner.status.state {
                SessionState::Uninitialized => {
                    self.transition(
                        &mut inner,
                        SessionState::Stopped,
                        Some("Session closed before start".to_string()),
                    );
                    return Some(TeardownReport::default());
                }
                SessionState::Starting => {
                    info!(session_id = %self.session_id, "Stop requested while starting");
                    inner.stop_requested = true;
                    return None;
                }
                SessionState::Stopping | SessionState::Stopped | SessionState::Failed(_) => {
                    return None;
                }
                SessionState::Ready | SessionState::AttachingShell | SessionState::Streaming => {}
            }

            self.transition(&mut inner, SessionState::Stopping, None);
            (inner.container_id.clone(), inner.shell.take())
        };

        let grace = self.settings.shutdown_grace;
        let mut report = TeardownReport::default();

        if let Some(shell) = shell {
            let exited_by_itself = matches!(*shell.exit.borrow(), Some(ProcessExit::Exited(_)));
            if !exited_by_itself {
                shell.cancel.cancel();
            }

            let mut exit = shell.exit.clone();
            let reaped = tokio::time::timeout(grace, exit.wait_for(Option::is_some))
                .await
                .map(|waited| waited.is_ok())
                .unwrap_or(false);

            if !reaped {
                warn!(session_id = %self.session_id, "Shell did not exit within the grace period");
                metrics::record_teardown_failure("process");
                report.process_error = Some("shell did not exit in time".to_string());
                shell.supervisor.abort();
            }

            shell.pump.shutdown(grace).await;
            metrics::record_streaming(-1.0);
        }

        if let Some(container_id) = &container_id {
            let runtime_report = self.runtime.stop_and_remove(container_id).await;
            if runtime_report.stop_error.is_some() {
                metrics::record_teardown_failure("stop");
            }
            if runtime_report.remove_error.is_some() {
                metrics::record_teardown_failure("remove");
            }
            report.stop_error = runtime_report.stop_error;
            report.remove_error = runtime_report.remove_error;
        }

        {
            let mut inner = self.inner.lock().await;
            let detail = (!report.is_clean())
                .then(|| format!("Container stopped with errors ({})", report.summary()));
            self.transition(&mut inner, SessionState::Stopped, detail);
        }
        metrics::record_session_stopped();

        info!(
            session_id = %self.session_id,
            container_id = ?container_id,
            clean = report.is_clean(),
            "Session terminated"
        );

        Some(report)
    }
}

/// Thread-safe session handle
pub type SessionHandle = Arc<ContainerSession>;

/// Run a runtime call with an optional upper bound
async fn bounded<T>(
    limit: Option<Duration>,
    call: impl Future<Output = Result<T, RuntimeError>>,
    on_timeout: fn(String) -> RuntimeError,
) -> Result<T, RuntimeError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(on_timeout(format!("timed out after {}s", limit.as_secs())))),
        None => call.await,
    }
}

/// Own the shell process: publish its exit, or kill it when teardown cancels
async fn supervise(
    mut process: Box<dyn ShellProcess>,
    cancel: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    session: Weak<ContainerSession>,
    session_id: Uuid,
) {
    let exit = tokio::select! {
        status = process.wait() => match status {
            Ok(code) => ProcessExit::Exited(code),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed waiting on shell");
                ProcessExit::Exited(None)
            }
        },
        _ = cancel.cancelled() => {
            if let Err(e) = process.kill().await {
                warn!(session_id = %session_id, error = %e, "Failed to kill shell");
            }
            ProcessExit::Killed
        }
    };

    exit_tx.send_replace(Some(exit));

    if let ProcessExit::Exited(code) = exit {
        info!(session_id = %session_id, exit_code = ?code, "Shell exited; tearing down session");
        if let Some(session) = session.upgrade() {
            tokio::spawn(async move {
                session.terminate().await;
            });
        }
    }
}
