//! Conversation endpoints.
//!
//! - `GET  /v1/conversations`                — list (own, or all for approvers)
//! - `POST /v1/conversations`               — create
//! - `GET  /v1/conversations/:id`           — fetch one
//! - `GET  /v1/conversations/:id/messages`  — ordered messages, `after_seq`
//!   for reconnect backfill

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;

use parley_domain::error::ErrorCode;
use parley_store::StoreError;

use crate::api::api_error;
use crate::auth::Identity;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    #[serde(rename = "domainId")]
    pub domain_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateConversationBody>,
) -> Response {
    let snapshot = state.registry.snapshot();
    let Some(domain) = snapshot.get_domain(&body.domain_id) else {
        return api_error(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("domain {} not found", body.domain_id),
        );
    };
    if !domain.role_allowed(identity.role) {
        return api_error(
            StatusCode::FORBIDDEN,
            ErrorCode::Forbidden,
            format!("role {} may not use domain {}", identity.role, domain.id),
        );
    }

    match state
        .store
        .create_conversation(&domain.id, &identity.sub, body.title.as_deref())
    {
        Ok(conversation) => (StatusCode::CREATED, Json(conversation)).into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}

pub async fn list(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Response {
    // Approver roles see everything; everyone else sees their own.
    let creator_filter = if identity.role.can_approve_tools() {
        None
    } else {
        Some(identity.sub.as_str())
    };
    match state.store.list_conversations(creator_filter) {
        Ok(conversations) => Json(serde_json::json!({ "conversations": conversations }))
            .into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_conversation(&id) {
        Ok(conversation) => Json(conversation).into_response(),
        Err(StoreError::NotFound(_)) => api_error(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("conversation {id} not found"),
        ),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub after_seq: Option<i64>,
}

pub async fn messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    if let Err(StoreError::NotFound(_)) = state.store.get_conversation(&id) {
        return api_error(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("conversation {id} not found"),
        );
    }
    match state.store.list_messages(&id, query.after_seq) {
        Ok(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StreamError,
            e.to_string(),
        ),
    }
}
