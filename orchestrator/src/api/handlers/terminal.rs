//! Terminal WebSocket handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::{ClientEvent, ServerEvent};
use crate::tty::TerminalController;
use crate::AppState;

/// Handle terminal WebSocket upgrade
pub async fn terminal_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_terminal_socket(socket, state))
}

/// Handle one terminal connection until the client goes away
async fn handle_terminal_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let (events_tx, mut events_rx) =
        mpsc::channel::<ServerEvent>(state.config.terminal.output_channel_capacity);
    let controller = state.tty_manager.connect(events_tx.clone()).await;
    let connection_id = controller.connection_id;

    info!(connection_id = %connection_id, "Terminal WebSocket connection established");

    // Single writer: output, status and replies all go through the event channel
    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize server event");
                    continue;
                }
            };

            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let _ = events_tx.send(ServerEvent::Connected { connection_id }).await;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!(connection_id = %connection_id, "Terminal event received: {}", text);

                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => dispatch(event, &controller, &events_tx).await,
                    Err(e) => {
                        let _ = events_tx
                            .send(ServerEvent::error(format!("Invalid event: {}", e)))
                            .await;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!(connection_id = %connection_id, "Terminal WebSocket connection closed");
                break;
            }
            Err(e) => {
                error!(connection_id = %connection_id, "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Teardown runs in the background; the connection does not wait for Stopped
    let manager = state.tty_manager.clone();
    tokio::spawn(async move {
        manager.disconnect(&connection_id).await;
    });

    writer.abort();
}

/// Apply one client event to the connection's controller
async fn dispatch(
    event: ClientEvent,
    controller: &Arc<TerminalController>,
    events: &mpsc::Sender<ServerEvent>,
) {
    match event {
        ClientEvent::StartSession => {
            if !controller.start_session().await {
                let snapshot = controller.status().await;
                let message = format!(
                    "Session is {}; start-session ignored",
                    snapshot.state.tag()
                );
                let _ = events.send(ServerEvent::error(message)).await;
                let _ = events.send(ServerEvent::status(&snapshot)).await;
            }
        }
        ClientEvent::ClientInput(line) => {
            // Rejected input is a no-op for the client
            let _ = controller.client_input(&line).await;
        }
        ClientEvent::Status => {
            let snapshot = controller.status().await;
            let _ = events.send(ServerEvent::status(&snapshot)).await;
        }
        ClientEvent::StopSession => {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller.stop_session().await;
            });
        }
        ClientEvent::Ping => {
            let _ = events.send(ServerEvent::Pong).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

    use crate::config::AppConfig;
    use crate::testing::{eventually, FakeRuntime};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(runtime: Arc<FakeRuntime>) -> (SocketAddr, Arc<AppState>) {
        let mut config = AppConfig::default();
        config.terminal.greeting_command = None;
        config.terminal.shutdown_grace_ms = 1000;

        let state = Arc::new(AppState::new(config, runtime));
        let router = crate::api::create_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (addr, state)
    }

    async fn send(client: &mut Client, frame: Value) {
        client
            .send(tungstenite::Message::Text(frame.to_string()))
            .await
            .unwrap();
    }

    /// Read frames until one matches, returning it
    async fn expect_event(client: &mut Client, matches: impl Fn(&Value) -> bool) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = client.next().await.expect("socket closed").unwrap();
                if let tungstenite::Message::Text(text) = frame {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if matches(&value) {
                        return value;
                    }
                }
            }
        })
        .await
        .expect("expected event never arrived")
    }

    #[tokio::test]
    async fn test_terminal_session_over_websocket() {
        let runtime = Arc::new(FakeRuntime::new());
        let (addr, state) = serve(runtime.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        let connected = expect_event(&mut client, |v| v["event"] == "connected").await;
        assert!(connected["connection_id"].is_string());
        assert_eq!(state.tty_manager.count().await, 1);

        send(&mut client, json!({"event": "ping"})).await;
        expect_event(&mut client, |v| v["event"] == "pong").await;

        send(&mut client, json!({"event": "start-session"})).await;
        expect_event(&mut client, |v| v["event"] == "status" && v["state"] == "streaming").await;

        send(&mut client, json!({"event": "client-input", "data": "echo hello\r"})).await;
        let output = expect_event(&mut client, |v| v["event"] == "terminal-output").await;
        assert_eq!(output["data"], "hello\r\n");
        assert_eq!(output["stream"], "stdout");

        send(&mut client, json!({"event": "status"})).await;
        let status = expect_event(&mut client, |v| v["event"] == "status").await;
        assert_eq!(status["status"], "Shell attached");

        client.close(None).await.unwrap();

        eventually(|| {
            let state = state.clone();
            async move { state.tty_manager.count().await == 0 }
        })
        .await;
        assert_eq!(runtime.count_calls("stop_and_remove container-1"), 1);
        assert!(runtime.shell_killed(0));
    }

    #[tokio::test]
    async fn test_invalid_frame_keeps_connection_open() {
        let runtime = Arc::new(FakeRuntime::new());
        let (addr, _state) = serve(runtime.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        expect_event(&mut client, |v| v["event"] == "connected").await;

        client
            .send(tungstenite::Message::Text("not json".to_string()))
            .await
            .unwrap();
        let error = expect_event(&mut client, |v| v["event"] == "error").await;
        assert!(error["message"].as_str().unwrap().starts_with("Invalid event"));

        // input with no session is silently dropped
        send(&mut client, json!({"event": "client-input", "data": "ls"})).await;
        send(&mut client, json!({"event": "ping"})).await;
        expect_event(&mut client, |v| v["event"] == "pong").await;
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_while_active_is_reported() {
        let runtime = Arc::new(FakeRuntime::new());
        let (addr, _state) = serve(runtime.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        expect_event(&mut client, |v| v["event"] == "connected").await;

        send(&mut client, json!({"event": "start-session"})).await;
        expect_event(&mut client, |v| v["state"] == "streaming").await;

        send(&mut client, json!({"event": "start-session"})).await;
        let error = expect_event(&mut client, |v| v["event"] == "error").await;
        assert_eq!(error["message"], "Session is streaming; start-session ignored");
        let status = expect_event(&mut client, |v| v["event"] == "status").await;
        assert_eq!(status["state"], "streaming");

        assert_eq!(runtime.count_calls("create"), 1);
    }

    #[tokio::test]
    async fn test_stop_then_restart_uses_fresh_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let (addr, _state) = serve(runtime.clone()).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        expect_event(&mut client, |v| v["event"] == "connected").await;

        send(&mut client, json!({"event": "start-session"})).await;
        expect_event(&mut client, |v| v["state"] == "streaming").await;

        send(&mut client, json!({"event": "stop-session"})).await;
        expect_event(&mut client, |v| v["state"] == "stopped").await;

        send(&mut client, json!({"event": "start-session"})).await;
        expect_event(&mut client, |v| v["state"] == "streaming").await;

        assert_eq!(runtime.count_calls("create"), 2);
        assert_eq!(runtime.count_calls("attach container-2"), 1);
    }
}
