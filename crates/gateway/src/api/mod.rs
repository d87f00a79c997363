//! REST API router.
//!
//! Routes are split into **public** (health, metrics, login, the WebSocket
//! upgrade — which authenticates at the handshake) and **protected**
//! (everything else, behind the bearer-token middleware).

pub mod chat;
pub mod config;
pub mod conversations;
pub mod health;
pub mod tool_runs;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use parley_domain::error::ErrorCode;

use crate::auth::require_identity;
use crate::state::AppState;

/// Uniform error body: `{"error": <code>, "message": <human text>}`.
pub(crate) fn api_error(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Build the full API router.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/health/details", get(health::health_details))
        .route("/metrics", get(health::metrics))
        .route("/v1/auth/login", post(health::login))
        .route("/ws", get(crate::hub::ws::session_ws));

    let protected = Router::new()
        // Conversations
        .route(
            "/v1/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route("/v1/conversations/:id", get(conversations::get_one))
        .route(
            "/v1/conversations/:id/messages",
            get(conversations::messages),
        )
        // Chat (non-streaming)
        .route("/v1/chat/send", post(chat::send))
        // Tool runs
        .route("/v1/tool-runs", get(tool_runs::list))
        .route("/v1/tool-runs/:id", get(tool_runs::get_one))
        .route("/v1/tool-runs/:id/approve", post(tool_runs::approve))
        .route("/v1/tool-runs/:id/reject", post(tool_runs::reject))
        // Config
        .route("/v1/config/reload", post(config::reload))
        .route("/v1/config/status", get(config::status))
        .route("/v1/config/sync", get(config::sync))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ));

    public.merge(protected)
}
