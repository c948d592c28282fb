//! In-memory container runtime and shell for unit tests

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::container::runtime::{
    AttachedProcess, ContainerRuntime, RuntimeError, ShellPipes, ShellProcess, TeardownReport,
};
use crate::stream::{OutputChunk, StreamKind};

/// Spawn a tiny line-oriented shell over in-memory pipes.
///
/// `echo X` prints X on stdout, `warn X` prints X on stderr, `exit` ends the shell,
/// anything else is "command not found" on stderr.
pub(crate) fn spawn_fake_shell() -> (AttachedProcess, Arc<AtomicBool>) {
    let (stdin, shell_stdin) = duplex(4096);
    let (shell_stdout, stdout) = duplex(4096);
    let (shell_stderr, stderr) = duplex(4096);

    let task = tokio::spawn(run_fake_shell(shell_stdin, shell_stdout, shell_stderr));
    let killed = Arc::new(AtomicBool::new(false));

    let process = AttachedProcess {
        pipes: ShellPipes {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        },
        process: Box::new(FakeProcess {
            task: Some(task),
            killed: killed.clone(),
        }),
    };

    (process, killed)
}

async fn run_fake_shell(
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) -> Option<i32> {
    let mut lines = BufReader::new(stdin).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (target, text) = if line == "exit" {
            return Some(0);
        } else if let Some(rest) = line.strip_prefix("echo ") {
            (&mut stdout, unquote(rest).to_string())
        } else if let Some(rest) = line.strip_prefix("warn ") {
            (&mut stderr, unquote(rest).to_string())
        } else if line.is_empty() {
            continue;
        } else {
            (&mut stderr, format!("bash: {}: command not found", line))
        };

        if target.write_all(format!("{}\n", text).as_bytes()).await.is_err() {
            break;
        }
    }

    Some(0)
}

fn unquote(text: &str) -> &str {
    text.trim_matches(|c| c == '\'' || c == '"')
}

pub(crate) struct FakeProcess {
    task: Option<JoinHandle<Option<i32>>>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl ShellProcess for FakeProcess {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let code = match self.task.as_mut() {
            Some(task) => task.await.unwrap_or(None),
            None => return Ok(None),
        };
        self.task = None;
        Ok(code)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

/// Runtime double handing out sequential container ids and fake shells
#[derive(Default)]
pub(crate) struct FakeRuntime {
    next_id: AtomicUsize,
    calls: Mutex<Vec<String>>,
    kill_flags: Mutex<Vec<Arc<AtomicBool>>>,
    create_gate: Option<Arc<Notify>>,
    attach_gate: Option<Arc<Notify>>,
    fail_attach: bool,
    fail_stop: bool,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `create_container` blocks until the gate is notified
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            create_gate: Some(gate),
            ..Self::default()
        }
    }

    /// `attach_shell` blocks until the gate is notified, then succeeds
    pub(crate) fn gated_attach(gate: Arc<Notify>) -> Self {
        Self {
            attach_gate: Some(gate),
            ..Self::default()
        }
    }

    /// `attach_shell` blocks until the gate is notified, then fails
    pub(crate) fn gated_failing_attach(gate: Arc<Notify>) -> Self {
        Self {
            attach_gate: Some(gate),
            fail_attach: true,
            ..Self::default()
        }
    }

    /// `stop_and_remove` reports a failed stop step
    pub(crate) fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Whether the n-th attached shell (0-based) was killed
    pub(crate) fn shell_killed(&self, index: usize) -> bool {
        self.kill_flags.lock().unwrap()[index].load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        keepalive_command: &[String],
    ) -> Result<String, RuntimeError> {
        if let Some(gate) = &self.create_gate {
            gate.notified().await;
        }

        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record(format!(
            "create {} {} {} -> {}",
            name,
            image,
            keepalive_command.join(" "),
            id
        ));
        Ok(id)
    }

    async fn attach_shell(
        &self,
        handle: &str,
        shell_command: &[String],
    ) -> Result<AttachedProcess, RuntimeError> {
        if let Some(gate) = &self.attach_gate {
            gate.notified().await;
        }

        self.record(format!("attach {} {}", handle, shell_command.join(" ")));
        if self.fail_attach {
            return Err(RuntimeError::AttachFailed(format!(
                "container {} is not running",
                handle
            )));
        }

        let (process, killed) = spawn_fake_shell();
        self.kill_flags.lock().unwrap().push(killed);
        Ok(process)
    }

    async fn stop_and_remove(&self, handle: &str) -> TeardownReport {
        self.record(format!("stop_and_remove {}", handle));
        if self.fail_stop {
            TeardownReport {
                stop_error: Some(format!("Error response from daemon: No such container: {}", handle)),
                ..TeardownReport::default()
            }
        } else {
            TeardownReport::default()
        }
    }

    async fn version(&self) -> Option<String> {
        Some("fake-runtime 1.0".to_string())
    }
}

/// Accumulate chunks of one stream until the text contains `needle`
pub(crate) async fn collect_output(
    rx: &mut mpsc::Receiver<OutputChunk>,
    stream: StreamKind,
    needle: &str,
) -> String {
    let mut collected = String::new();
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while !collected.contains(needle) {
            match rx.recv().await {
                Some(chunk) if chunk.stream == stream => collected.push_str(&chunk.data),
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;

    assert!(
        finished.is_ok() && collected.contains(needle),
        "timed out waiting for {:?}, got {:?}",
        needle,
        collected
    );
    collected
}

/// Poll until `check` holds, failing the test after a few seconds
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
