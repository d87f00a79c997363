//! Config endpoints — reload, status, and the snapshot hash for client
//! sync checks.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;

use parley_domain::config::ConfigFile;
use parley_domain::error::ErrorCode;

use crate::api::api_error;
use crate::auth::Identity;
use crate::state::AppState;

/// POST /v1/config/reload — re-read the domains file and atomically swap
/// the snapshot. On validation failure the previous snapshot stays live.
pub async fn reload(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Response {
    if !identity.role.can_approve_tools() {
        return api_error(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            format!("role {} may not reload config", identity.role),
        );
    }

    let file = match ConfigFile::load(&state.settings.domains_file) {
        Ok(file) => file,
        Err(e) => {
            return api_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCode::NotConfigured,
                e.to_string(),
            );
        }
    };

    match state.registry.reload(&file) {
        Ok(report) => {
            // Recompile tool schemas against the new snapshot.
            state.tools.rebuild(&state.registry.snapshot());
            Json(serde_json::json!({ "reloaded": true, "report": report })).into_response()
        }
        Err(e) => api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::NotConfigured,
            e.to_string(),
        ),
    }
}

/// GET /v1/config/status — counts and load time of the live snapshot.
pub async fn status(State(state): State<AppState>) -> Response {
    let snapshot = state.registry.snapshot();
    Json(serde_json::json!({
        "hash": snapshot.hash(),
        "loadedAt": snapshot.loaded_at,
        "domains": snapshot.domain_count(),
        "agents": snapshot.agent_count(),
        "tools": snapshot.tool_count(),
    }))
    .into_response()
}

/// GET /v1/config/sync — just the snapshot hash, for cheap client-side
/// staleness checks.
pub async fn sync(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "hash": state.registry.snapshot_hash() })).into_response()
}
