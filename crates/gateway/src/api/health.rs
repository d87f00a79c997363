//! Health probes, Prometheus exposition, and the bootstrap login.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use parley_domain::error::ErrorCode;

use crate::api::api_error;
use crate::state::AppState;

/// GET /health — lightweight liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health/details — per-subsystem readiness.
pub async fn health_details(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    let store_ok = state.store.list_conversations(Some("__healthcheck__")).is_ok();
    Json(serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "config": {
            "hash": snapshot.hash(),
            "domains": snapshot.domain_count(),
            "agents": snapshot.agent_count(),
            "tools": snapshot.tool_count(),
        },
        "store": { "ok": store_ok },
        "llm": { "configured": !state.pool.is_empty() },
        "sessions": {
            "connected": state.hub.session_count(),
            "activeTurns": state.turn_locks.len(),
            "pendingApprovals": state.approvals.pending_waiters(),
        },
    }))
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

/// POST /v1/auth/login — exchange bootstrap credentials for a JWT.
pub async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Response {
    match state.auth.login(&body.username, &body.password) {
        Ok(access_token) => {
            Json(serde_json::json!({ "access_token": access_token })).into_response()
        }
        Err(_) => api_error(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthorized,
            "invalid credentials",
        ),
    }
}
