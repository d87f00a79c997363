//! Tool-run endpoints: audit listing plus the REST approval path (used
//! after reconnects, when no live session holds the conversation).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;

use parley_domain::error::ErrorCode;
use parley_domain::records::ToolRunStatus;
use parley_store::{StoreError, ToolRunFilter};

use crate::api::api_error;
use crate::auth::Identity;
use crate::runtime::approval::SubmitError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<ToolRunStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                return api_error(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, e);
            }
        },
    };
    let filter = ToolRunFilter {
        conversation_id: query.conversation_id,
        status,
        limit: query.limit,
    };
    match state.store.list_tool_runs(&filter) {
        Ok(runs) => Json(serde_json::json!({ "toolRuns": runs })).into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_tool_run(&id) {
        Ok(run) => {
            let audit = state.store.list_workflow_logs(&id).unwrap_or_default();
            Json(serde_json::json!({ "toolRun": run, "audit": audit })).into_response()
        }
        Err(StoreError::NotFound(_)) => api_error(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("tool run {id} not found"),
        ),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct DecisionBody {
    #[serde(default)]
    pub reason: Option<String>,
}

fn submit(state: &AppState, identity: &Identity, id: &str, approved: bool, reason: Option<String>) -> Response {
    if !identity.role.can_approve_tools() {
        return api_error(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            format!("role {} may not decide approvals", identity.role),
        );
    }
    match state
        .approvals
        .submit_decision(id, approved, reason, &identity.sub)
    {
        Ok(run) => Json(serde_json::json!({ "toolRun": run })).into_response(),
        Err(SubmitError::NotFound(_)) => api_error(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("tool run {id} not found"),
        ),
        Err(e @ SubmitError::IllegalDecision { .. }) => {
            api_error(StatusCode::CONFLICT, ErrorCode::Conflict, e.to_string())
        }
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}

pub async fn approve(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    body: Option<Json<DecisionBody>>,
) -> Response {
    let reason = body.and_then(|Json(b)| b.reason);
    submit(&state, &identity, &id, true, reason)
}

pub async fn reject(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    body: Option<Json<DecisionBody>>,
) -> Response {
    let reason = body.and_then(|Json(b)| b.reason);
    submit(&state, &identity, &id, false, reason)
}
