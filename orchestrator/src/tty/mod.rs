//! Interactive terminal connections
//!
//! Each WebSocket connection owns one `TerminalController`, which owns exactly one
//! container session at a time. `TtyManager` tracks the live connections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{
    ContainerRuntime, ContainerSession, SessionError, SessionHandle, SessionSettings,
    StatusSnapshot, TeardownReport,
};
use crate::models::{ServerEvent, SessionSummary};
use crate::stream::{OutputChunk, OutputSink};

#[async_trait]
impl OutputSink for mpsc::Sender<ServerEvent> {
    async fn send_output(&self, chunk: OutputChunk) -> bool {
        let event = ServerEvent::TerminalOutput {
            data: chunk.data,
            stream: chunk.stream,
        };
        self.send(event).await.is_ok()
    }
}

struct SessionSlot {
    handle: SessionHandle,
    started: bool,
}

/// Controller for one client connection
pub struct TerminalController {
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: SessionSettings,
    events: mpsc::Sender<ServerEvent>,
    slot: RwLock<SessionSlot>,
}

impl TerminalController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: SessionSettings,
        events: mpsc::Sender<ServerEvent>,
    ) -> Self {
        let handle = Arc::new(ContainerSession::new(runtime.clone(), settings.clone()));

        Self {
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            runtime,
            settings,
            events,
            slot: RwLock::new(SessionSlot {
                handle,
                started: false,
            }),
        }
    }

    /// Current session handle
    pub async fn session(&self) -> SessionHandle {
        self.slot.read().await.handle.clone()
    }

    /// Current status snapshot; never mutates state
    pub async fn status(&self) -> StatusSnapshot {
        self.session().await.status().await
    }

    /// Provision a container and attach a shell in the background.
    ///
    /// A finished session is replaced by a fresh one; an active session is left alone
    /// and `false` is returned.
    pub async fn start_session(&self) -> bool {
        let session = {
            let mut slot = self.slot.write().await;
            let state = slot.handle.status().await.state;

            if state.is_terminal() {
                slot.handle = Arc::new(ContainerSession::new(
                    self.runtime.clone(),
                    self.settings.clone(),
                ));
            } else if slot.started {
                info!(
                    connection_id = %self.connection_id,
                    state = %state,
                    "Session already active; ignoring start request"
                );
                return false;
            }

            slot.started = true;
            slot.handle.clone()
        };

        info!(
            connection_id = %self.connection_id,
            session_id = %session.session_id,
            "Starting session"
        );

        tokio::spawn(forward_status(
            session.subscribe(),
            self.events.clone(),
            self.connection_id,
        ));

        let sink: Arc<dyn OutputSink> = Arc::new(self.events.clone());
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            let result = match session.begin().await {
                Ok(()) => session.attach(sink).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                warn!(
                    connection_id = %connection_id,
                    session_id = %session.session_id,
                    error = %e,
                    "Session provisioning did not complete"
                );
            }
        });

        true
    }

    /// Forward one client line; rejections are logged and otherwise ignored
    pub async fn client_input(&self, line: &str) -> Result<(), SessionError> {
        let session = self.session().await;
        let result = session.submit_input(line).await;

        if let Err(e) = &result {
            debug!(
                connection_id = %self.connection_id,
                session_id = %session.session_id,
                error = %e,
                "Input rejected"
            );
        }

        result
    }

    /// Tear down the current session, keeping the connection open
    pub async fn stop_session(&self) -> Option<TeardownReport> {
        let session = self.session().await;
        info!(
            connection_id = %self.connection_id,
            session_id = %session.session_id,
            "Stopping session"
        );
        session.terminate().await
    }

    /// Connection closed: always stop the container
    pub async fn disconnect(&self) -> Option<TeardownReport> {
        info!(connection_id = %self.connection_id, "Client disconnected");
        self.session().await.terminate().await
    }

    /// Summary used by the sessions API
    pub async fn summary(&self) -> SessionSummary {
        let session = self.session().await;
        let status = session.status().await;

        SessionSummary {
            connection_id: self.connection_id,
            session_id: session.session_id,
            container_name: session.container_name.clone(),
            state: status.state.tag().to_string(),
            status: status.status_line(),
            container_id: session.container_id().await,
            connected_at: self.connected_at,
        }
    }
}

/// Push every status change of one session to the client until it finishes
async fn forward_status(
    mut updates: tokio::sync::watch::Receiver<StatusSnapshot>,
    events: mpsc::Sender<ServerEvent>,
    connection_id: Uuid,
) {
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();

        if events.send(ServerEvent::status(&snapshot)).await.is_err() {
            debug!(connection_id = %connection_id, "Client gone; stopping status updates");
            return;
        }

        if snapshot.state.is_terminal() {
            return;
        }
    }
}

/// Registry of live terminal connections
pub struct TtyManager {
    connections: RwLock<HashMap<Uuid, Arc<TerminalController>>>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: SessionSettings,
}

impl TtyManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SessionSettings) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            runtime,
            settings,
        }
    }

    /// Register a new connection with an uninitialized session
    pub async fn connect(&self, events: mpsc::Sender<ServerEvent>) -> Arc<TerminalController> {
        let controller = Arc::new(TerminalController::new(
            self.runtime.clone(),
            self.settings.clone(),
            events,
        ));

        self.connections
            .write()
            .await
            .insert(controller.connection_id, controller.clone());

        info!(connection_id = %controller.connection_id, "Client connected");
        controller
    }

    pub async fn get(&self, connection_id: &Uuid) -> Option<Arc<TerminalController>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Summaries of every live connection, oldest first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let controllers: Vec<_> = self.connections.read().await.values().cloned().collect();

        let mut summaries = futures::future::join_all(controllers.iter().map(|c| c.summary())).await;
        summaries.sort_by_key(|s| s.connected_at);
        summaries
    }

    /// Tear down a connection's session, then forget the connection
    pub async fn disconnect(&self, connection_id: &Uuid) -> Option<TeardownReport> {
        let controller = self.get(connection_id).await?;
        let report = controller.disconnect().await;

        self.connections.write().await.remove(connection_id);
        debug!(connection_id = %connection_id, "Connection removed");

        report
    }

    /// Disconnect every live connection
    pub async fn shutdown_all(&self) {
        let ids: Vec<Uuid> = self.connections.read().await.keys().copied().collect();
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "Stopping all sessions");
        futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio_test::assert_err;

    use crate::container::SessionState;
    use crate::stream::PumpError;
    use crate::testing::{eventually, FakeRuntime};

    fn settings() -> SessionSettings {
        SessionSettings {
            greeting_command: None,
            shutdown_grace: Duration::from_secs(1),
            ..SessionSettings::default()
        }
    }

    fn manager(runtime: Arc<FakeRuntime>) -> TtyManager {
        TtyManager::new(runtime, settings())
    }

    async fn wait_for_state(controller: &Arc<TerminalController>, tag: &'static str) {
        eventually(|| {
            let controller = controller.clone();
            async move { controller.status().await.state.tag() == tag }
        })
        .await;
    }

    async fn next_output(events: &mut mpsc::Receiver<ServerEvent>, needle: &str) -> String {
        let mut collected = String::new();
        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            while !collected.contains(needle) {
                match events.recv().await {
                    Some(ServerEvent::TerminalOutput { data, .. }) => collected.push_str(&data),
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await;
        assert!(finished.is_ok(), "no output containing {:?}", needle);
        collected
    }

    #[tokio::test]
    async fn test_input_reaches_shell_and_output_comes_back() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(runtime);
        let (tx, mut events) = mpsc::channel(256);
        let controller = manager.connect(tx).await;

        assert!(controller.start_session().await);
        wait_for_state(&controller, "streaming").await;

        controller.client_input("echo hello").await.unwrap();
        let output = next_output(&mut events, "hello").await;
        assert_eq!(output, "hello\r\n");
    }

    #[tokio::test]
    async fn test_status_events_follow_provisioning() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(runtime);
        let (tx, mut events) = mpsc::channel(256);
        let controller = manager.connect(tx).await;

        controller.start_session().await;

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let ServerEvent::Status { state, .. } = event {
                    let done = state == "streaming";
                    seen.push(state);
                    if done {
                        break;
                    }
                }
            }
        })
        .await
        .expect("session never reported streaming");

        // updates may coalesce, but never go backwards
        let order = ["starting", "ready", "attaching_shell", "streaming"];
        let positions: Vec<usize> = seen
            .iter()
            .map(|state| order.iter().position(|o| o == state).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);
    }

    #[tokio::test]
    async fn test_input_before_start_is_noop() {
        let manager = manager(Arc::new(FakeRuntime::new()));
        let (tx, _events) = mpsc::channel(16);
        let controller = manager.connect(tx).await;

        let err = assert_err!(controller.client_input("ls").await);
        assert_eq!(err, SessionError::Input(PumpError::ProcessAbsent));
        assert_eq!(controller.status().await.state, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_ignored() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(runtime.clone());
        let (tx, _events) = mpsc::channel(256);
        let controller = manager.connect(tx).await;

        assert!(controller.start_session().await);
        assert!(!controller.start_session().await);
        wait_for_state(&controller, "streaming").await;
        assert!(!controller.start_session().await);

        assert_eq!(runtime.count_calls("create"), 1);
    }

    #[tokio::test]
    async fn test_sequential_sessions_never_share_handles() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(runtime.clone());
        let (tx, _events) = mpsc::channel(256);
        let controller = manager.connect(tx).await;

        controller.start_session().await;
        wait_for_state(&controller, "streaming").await;
        let first = controller.session().await;
        let first_container = first.container_id().await;

        assert!(controller.stop_session().await.is_some());
        assert_eq!(first.status().await.state, SessionState::Stopped);

        assert!(controller.start_session().await);
        wait_for_state(&controller, "streaming").await;
        let second = controller.session().await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first_container.as_deref(), Some("container-1"));
        assert_eq!(second.container_id().await.as_deref(), Some("container-2"));
        assert_eq!(first.container_id().await, None);
        assert!(runtime.shell_killed(0));
        assert!(!runtime.shell_killed(1));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_and_forgets_connection() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(runtime.clone());
        let (tx, _events) = mpsc::channel(256);
        let controller = manager.connect(tx).await;
        let id = controller.connection_id;

        controller.start_session().await;
        wait_for_state(&controller, "streaming").await;
        assert_eq!(manager.count().await, 1);
        assert_eq!(manager.list().await[0].state, "streaming");

        let report = manager.disconnect(&id).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(controller.status().await.state, SessionState::Stopped);
        assert!(manager.get(&id).await.is_none());
        assert_eq!(manager.count().await, 0);
        assert_eq!(runtime.count_calls("stop_and_remove container-1"), 1);

        assert!(manager.disconnect(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_every_session() {
        let runtime = Arc::new(FakeRuntime::new());
        let manager = manager(runtime.clone());

        let mut keep = Vec::new();
        for _ in 0..3 {
            let (tx, events) = mpsc::channel(256);
            keep.push(events);
            let controller = manager.connect(tx).await;
            controller.start_session().await;
            wait_for_state(&controller, "streaming").await;
        }

        manager.shutdown_all().await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(runtime.count_calls("stop_and_remove"), 3);
    }
}
