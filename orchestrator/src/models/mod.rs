//! Data models for the dockshell orchestrator
//!
//! This module defines the WebSocket event frames and the HTTP response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::StatusSnapshot;
use crate::stream::StreamKind;

// ============================================================================
// WebSocket Events
// ============================================================================

/// Frame sent by the client terminal: `{"event": "...", "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Provision a container and attach a shell
    StartSession,
    /// One line typed by the user
    ClientInput(String),
    /// Ask for the current status
    Status,
    /// Tear the session down but keep the connection
    StopSession,
    Ping,
}

/// Frame pushed to the client terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected {
        connection_id: Uuid,
    },
    TerminalOutput {
        data: String,
        stream: StreamKind,
    },
    Status {
        status: String,
        state: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn status(snapshot: &StatusSnapshot) -> Self {
        ServerEvent::Status {
            status: snapshot.status_line(),
            state: snapshot.state.tag().to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

// ============================================================================
// Session Models
// ============================================================================

/// Status of one connection's session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub connection_id: Uuid,
    pub session_id: Uuid,
    pub status: String,
    pub state: String,
    #[serde(default)]
    pub container_id: Option<String>,
}

/// Live connection summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub connection_id: Uuid,
    pub session_id: Uuid,
    pub container_name: String,
    pub state: String,
    pub status: String,
    #[serde(default)]
    pub container_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Session list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

// ============================================================================
// Health Models
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_connections: u64,
    #[serde(default)]
    pub runtime_version: Option<String>,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

// ============================================================================
// Error Models
// ============================================================================

/// Standard error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
