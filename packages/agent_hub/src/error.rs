use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pty_manager::SpawnError;
use thiserror::Error;

/// Failures of registry and session operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} already has a live process")]
    AlreadyRunning(String),
    #[error("session {0} has no live process")]
    NotRunning(String),
    #[error("session {0} is live and cannot be removed")]
    RemoveConflict(String),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl SessionError {
    /// Stable machine-readable code used in JSON bodies and protocol notices.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "not_found",
            SessionError::AlreadyRunning(_) => "already_running",
            SessionError::NotRunning(_) => "not_running",
            SessionError::RemoveConflict(_) => "remove_conflict",
            SessionError::Spawn(_) => "spawn_failed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::AlreadyRunning(_)
            | SessionError::NotRunning(_)
            | SessionError::RemoveConflict(_) => StatusCode::CONFLICT,
            SessionError::Spawn(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (self.status(), body).into_response()
    }
}
