//! Container runtime adapter
//!
//! Thin wrapper over the docker/podman command line: create a detached container,
//! attach an interactive shell with piped stdio, and stop+remove it again.
//! No retries happen here; callers own any retry policy.

use std::io;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Errors reported by the container runtime
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("RuntimeUnavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("CreateFailed: {0}")]
    CreateFailed(String),

    #[error("AttachFailed: {0}")]
    AttachFailed(String),
}

impl RuntimeError {
    /// Short tag used for metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::RuntimeUnavailable(_) => "runtime_unavailable",
            RuntimeError::CreateFailed(_) => "create_failed",
            RuntimeError::AttachFailed(_) => "attach_failed",
        }
    }
}

/// Writable end of the shell's stdin
pub type ProcessInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable end of the shell's stdout or stderr
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Pipe endpoints of an attached shell
pub struct ShellPipes {
    pub stdin: ProcessInput,
    pub stdout: ProcessOutput,
    pub stderr: ProcessOutput,
}

/// Lifecycle control over an attached shell process
#[async_trait]
pub trait ShellProcess: Send {
    /// Wait for the process to exit, returning its exit code if it has one
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
impl ShellProcess for tokio::process::Child {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        tokio::process::Child::wait(self).await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        tokio::process::Child::kill(self).await
    }
}

/// An interactive process running inside a container
pub struct AttachedProcess {
    pub pipes: ShellPipes,
    pub process: Box<dyn ShellProcess>,
}

/// Outcome of a best-effort teardown; for observability only
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub process_error: Option<String>,
    pub stop_error: Option<String>,
    pub remove_error: Option<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.process_error.is_none() && self.stop_error.is_none() && self.remove_error.is_none()
    }

    /// Human readable list of the steps that failed
    pub fn summary(&self) -> String {
        [
            ("process", &self.process_error),
            ("stop", &self.stop_error),
            ("remove", &self.remove_error),
        ]
        .iter()
        .filter_map(|(step, err)| err.as_ref().map(|e| format!("{}: {}", step, e)))
        .collect::<Vec<_>>()
        .join("; ")
    }
}

/// Container runtime capability used by sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container running a non-terminating placeholder command
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        keepalive_command: &[String],
    ) -> Result<String, RuntimeError>;

    /// Start an interactive command inside a running container
    async fn attach_shell(
        &self,
        handle: &str,
        shell_command: &[String],
    ) -> Result<AttachedProcess, RuntimeError>;

    /// Stop then remove a container; never fails, sub-failures land in the report
    async fn stop_and_remove(&self, handle: &str) -> TeardownReport;

    /// Runtime version string, `None` when the runtime cannot be reached
    async fn version(&self) -> Option<String>;
}

/// Runtime adapter driving the docker (or podman) CLI
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    /// Use an explicit binary, or find docker/podman on PATH
    pub fn new(binary: Option<&str>) -> Self {
        let binary = binary
            .map(str::to_string)
            .or_else(|| {
                ["docker", "podman"].iter().find_map(|candidate| {
                    which::which(candidate)
                        .ok()
                        .map(|p| p.to_string_lossy().to_string())
                })
            })
            .unwrap_or_else(|| "docker".to_string());

        Self { binary }
    }

    /// Get runtime binary path
    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        debug!(binary = %self.binary, args = ?args, "Running container runtime");

        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                RuntimeError::RuntimeUnavailable(format!("failed to run {}: {}", self.binary, e))
            })
    }
}

/// Map a failed runtime invocation, recognising an unreachable daemon
fn classify_failure(stderr: &str, otherwise: fn(String) -> RuntimeError) -> RuntimeError {
    let stderr = stderr.trim().to_string();
    let lowered = stderr.to_lowercase();
    if lowered.contains("cannot connect to the docker daemon")
        || lowered.contains("is the docker daemon running")
        || lowered.contains("connection refused")
    {
        RuntimeError::RuntimeUnavailable(stderr)
    } else {
        otherwise(stderr)
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        keepalive_command: &[String],
    ) -> Result<String, RuntimeError> {
        let mut args = vec!["run", "--detach", "--name", name, image];
        args.extend(keepalive_command.iter().map(String::as_str));

        let output = self.run(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr.trim(), "Container start failed");
            return Err(classify_failure(&stderr, RuntimeError::CreateFailed));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(RuntimeError::CreateFailed(
                "runtime returned an empty container id".to_string(),
            ));
        }

        info!(container_id = %container_id, container_name = %name, "Container started");
        Ok(container_id)
    }

    async fn attach_shell(
        &self,
        handle: &str,
        shell_command: &[String],
    ) -> Result<AttachedProcess, RuntimeError> {
        let output = self
            .run(&["inspect", "--format", "{{.State.Running}}", handle])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, RuntimeError::AttachFailed));
        }

        if String::from_utf8_lossy(&output.stdout).trim() != "true" {
            return Err(RuntimeError::AttachFailed(format!(
                "container {} is not running",
                handle
            )));
        }

        let mut child = Command::new(&self.binary)
            .args(["exec", "-i", handle])
            .args(shell_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RuntimeError::RuntimeUnavailable(format!(
                    "failed to run {}: {}",
                    self.binary, e
                )),
                _ => RuntimeError::AttachFailed(format!("failed to spawn shell: {}", e)),
            })?;

        let missing = || RuntimeError::AttachFailed("shell pipes were not captured".to_string());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        info!(container_id = %handle, shell = ?shell_command, "Shell attached");

        Ok(AttachedProcess {
            pipes: ShellPipes {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: Box::new(stderr),
            },
            process: Box::new(child),
        })
    }

    async fn stop_and_remove(&self, handle: &str) -> TeardownReport {
        let mut report = TeardownReport::default();

        for (step, args) in [("stop", ["stop", handle]), ("remove", ["rm", handle])] {
            let failure = match self.run(&args).await {
                Ok(output) if output.status.success() => None,
                Ok(output) => Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
                Err(e) => Some(e.to_string()),
            };

            if let Some(err) = failure {
                warn!(container_id = %handle, step, error = %err, "Container teardown step failed");
                match step {
                    "stop" => report.stop_error = Some(err),
                    _ => report.remove_error = Some(err),
                }
            }
        }

        if report.is_clean() {
            info!(container_id = %handle, "Container stopped and removed");
        }

        report
    }

    async fn version(&self) -> Option<String> {
        let output = self.run(&["--version"]).await.ok()?;

        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }
}
