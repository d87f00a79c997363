//! Non-streaming chat endpoint — `POST /v1/chat/send`.
//!
//! Runs a full turn and aggregates its events into one response. Events
//! are also fanned out to any WebSocket sessions subscribed to the
//! conversation, from this single drain, so both surfaces see the same
//! order.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;

use parley_domain::error::ErrorCode;

use crate::api::api_error;
use crate::auth::Identity;
use crate::runtime::{run_turn, TurnEvent, TurnInput};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendBody {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "enableThinking", default)]
    pub enable_thinking: bool,
    #[serde(rename = "testingOverride", default)]
    pub testing_override: bool,
}

pub async fn send(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<SendBody>,
) -> Response {
    if state.store.get_conversation(&body.conversation_id).is_err() {
        return api_error(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("conversation {} not found", body.conversation_id),
        );
    }

    let permit = match state.turn_locks.try_acquire(&body.conversation_id) {
        Ok(permit) => permit,
        Err(_) => {
            return api_error(
                StatusCode::CONFLICT,
                ErrorCode::Busy,
                "a turn is already in flight for this conversation",
            );
        }
    };

    let conversation_id = body.conversation_id.clone();
    let input = TurnInput {
        conversation_id: conversation_id.clone(),
        user_message: body.content,
        identity,
        enable_thinking: body.enable_thinking,
        testing_override: body.testing_override,
    };
    let (turn_id, mut rx) = run_turn(state.clone(), input, permit);

    // Drain the turn, mirroring every event to live subscribers.
    let mut content = String::new();
    let mut message_id = None;
    let mut agent_id = None;
    let mut tool_runs = Vec::new();
    let mut error = None;
    let mut cancelled = false;

    while let Some(event) = rx.recv().await {
        let wire = event.clone().into_server_message(&conversation_id);
        state.hub.publish(&conversation_id, &wire);

        match event {
            TurnEvent::Completed {
                message_id: id,
                content: text,
                agent_id: agent,
            } => {
                message_id = Some(id);
                content = text;
                agent_id = Some(agent);
            }
            TurnEvent::AgentSelected { agent_id: agent, .. } => {
                agent_id.get_or_insert(agent);
            }
            TurnEvent::ApprovalRequired { run_id, tool_name, .. } => {
                tool_runs.push(serde_json::json!({
                    "runId": run_id,
                    "toolName": tool_name,
                    "status": "PENDING",
                }));
            }
            TurnEvent::ToolExecuted {
                run_id, success, ..
            } => {
                tool_runs.push(serde_json::json!({
                    "runId": run_id,
                    "executed": true,
                    "success": success,
                }));
            }
            TurnEvent::Failed { code, message } => {
                error = Some(serde_json::json!({ "code": code, "message": message }));
            }
            TurnEvent::Cancelled => cancelled = true,
            _ => {}
        }
    }

    Json(serde_json::json!({
        "turnId": turn_id,
        "conversationId": conversation_id,
        "messageId": message_id,
        "content": content,
        "agentId": agent_id,
        "toolRuns": tool_runs,
        "cancelled": cancelled,
        "error": error,
    }))
    .into_response()
}
