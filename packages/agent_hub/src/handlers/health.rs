use axum::{Json, extract::State, response::IntoResponse};
use std::collections::BTreeMap;

use crate::AppState;
use crate::metrics;
use crate::session_actor::SessionStatus;

/// Health check endpoint - returns server status and session counts
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.list_statuses().await;
    let metrics = state.metrics.snapshot();

    let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
    for info in sessions.values() {
        *by_status.entry(info.status.as_str().to_string()).or_default() += 1;
    }
    let live = sessions.values().filter(|i| i.status.is_live()).count() as u64;

    // A session stuck in error needs attention even if the server is fine
    let status = if sessions.values().any(|i| i.status == SessionStatus::Error) {
        "degraded"
    } else {
        "healthy"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions: metrics::SessionHealth {
            total: sessions.len() as u64,
            live,
            by_status,
        },
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
