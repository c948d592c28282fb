//! Session inspection handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::api::ApiError;
use crate::models::{SessionListResponse, StatusResponse};
use crate::AppState;

/// List live connections with their session status
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    let sessions = state.tty_manager.list().await;
    let total = sessions.len();

    Json(SessionListResponse { sessions, total })
}

/// Status of one connection's session
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let connection_id = Uuid::parse_str(&connection_id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid connection id: {}", connection_id)))?;

    let controller = state
        .tty_manager
        .get(&connection_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No connection {}", connection_id)))?;

    let session = controller.session().await;
    let status = session.status().await;

    Ok(Json(StatusResponse {
        connection_id,
        session_id: session.session_id,
        status: status.status_line(),
        state: status.state.tag().to_string(),
        container_id: session.container_id().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::config::AppConfig;
    use crate::testing::FakeRuntime;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(AppConfig::default(), Arc::new(FakeRuntime::new())))
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let result = get_status(State(state()), Path(uuid::Uuid::new_v4().to_string())).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));

        let result = get_status(State(state()), Path("not-a-uuid".to_string())).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_status_of_idle_connection() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        let controller = state.tty_manager.connect(tx).await;

        let Json(status) = get_status(
            State(state.clone()),
            Path(controller.connection_id.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(status.state, "uninitialized");
        assert_eq!(status.status, "Initializing...");
        assert_eq!(status.container_id, None);

        let Json(list) = list_sessions(State(state)).await;
        assert_eq!(list.total, 1);
        assert_eq!(list.sessions[0].connection_id, controller.connection_id);
    }
}
