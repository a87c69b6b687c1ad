//! Control error type. Distinguishes failure kinds so callers (console,
//! HTTP layer, chat bridge) can react without parsing messages.

use std::time::Duration;

use crate::protocol::ProcessState;

/// Errors surfaced by containers, the process pump and the server manager.
///
/// Transport failures never appear here raw: they are translated into
/// `ConnectionUnhealthy` / `WriteFailed` at the socket and pipe boundaries.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error("Connection to daemon for server '{0}' is not healthy")]
    ConnectionUnhealthy(String),

    #[error("Failed to spawn process for '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    #[error("Failed to write to '{target}': {reason}")]
    WriteFailed { target: String, reason: String },

    #[error("Server '{server}' did not reach state {desired:?} within {waited:?}")]
    StateTimeout {
        server: String,
        desired: ProcessState,
        waited: Duration,
    },

    #[error("Server '{0}' not found")]
    ServerNotFound(String),
}

impl ControlError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::ConnectionUnhealthy(_) => "CONNECTION_UNHEALTHY",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::WriteFailed { .. } => "WRITE_FAILED",
            Self::StateTimeout { .. } => "STATE_TIMEOUT",
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
        }
    }

    /// Precondition failures are the caller's fault and are never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning(_)
                | Self::NotRunning(_)
                | Self::ConnectionUnhealthy(_)
                | Self::ServerNotFound(_)
        )
    }

    /// JSON body for collaborators that report errors over HTTP.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}
