use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::AppState;
use crate::error::SessionError;
use crate::params::SpawnRequest;
use crate::session_actor::SessionInfo;

pub async fn list_sessions(State(state): State<AppState>) -> Json<BTreeMap<String, SessionInfo>> {
    Json(state.registry.list_statuses().await)
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, SessionError> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or(SessionError::NotFound(id))
}

/// Start (creating if needed). An empty body reuses the stored params of an
/// existing record, or configured defaults for a new one.
pub async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let params = match parse_spawn_request(&body) {
        Ok(Some(request)) => request.resolve(state.registry.config()),
        Ok(None) => match state.registry.get(&id).await {
            Some(info) => info.spawn_params,
            None => SpawnRequest::default().resolve(state.registry.config()),
        },
        Err(response) => return response,
    };

    match state.registry.start(&id, params).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => {
            debug!(session_id = %id, error = %e, "Start rejected");
            e.into_response()
        }
    }
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, SessionError> {
    state.registry.stop(&id).await.map(Json)
}

/// Restart; a body amends only the fields it names.
pub async fn restart_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request = match parse_spawn_request(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let amended = match request {
        Some(request) => {
            let current = state.registry.get(&id).await;
            match current {
                Some(info) => Some(request.amend(&info.spawn_params)),
                None => return SessionError::NotFound(id).into_response(),
            }
        }
        None => None,
    };

    match state.registry.restart(&id, amended).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, SessionError> {
    state.registry.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_spawn_request(body: &[u8]) -> Result<Option<SpawnRequest>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body).map(Some).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("invalid spawn params: {e}") })),
        )
            .into_response()
    })
}
