//! WebSocket endpoint for chat sessions.
//!
//! Flow:
//! 1. Client connects to `GET /ws?token=<JWT>`; an invalid token closes
//!    the socket with 1008 immediately after the upgrade.
//! 2. Inbound messages are the tagged [`ClientMessage`] protocol; unknown
//!    tags get `error{bad_request}`, never silence.
//! 3. Outbound events flow through the session's bounded queue; a writer
//!    task drains it onto the socket.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use parley_domain::error::ErrorCode;
use parley_domain::protocol::{close, ClientMessage, ServerMessage};

use crate::hub::{pump_turn_events, SessionHandle};
use crate::runtime::{run_turn, TurnInput};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /ws — upgrade to a chat session.
pub async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    match state.auth.verify(&token) {
        Ok(identity) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, identity))
            .into_response(),
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake auth failed");
            ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close::AUTH_FAILURE,
                        reason: Cow::from("invalid or missing token"),
                    })))
                    .await;
            })
            .into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: crate::auth::Identity) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let handle = state.hub.register(identity);
    let session_id = handle.id;
    tracing::info!(session_id, sub = %handle.identity.sub, "session connected");

    // Writer: drain the outbound queue onto the socket, then close with
    // the session's close code (1000 normally, 4001 when kicked).
    let writer_handle = handle.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = writer_handle.queue.pop().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize outbound event");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        let _ = ws_sink
            .send(Message::Close(Some(CloseFrame {
                code: writer_handle.close_code(),
                reason: Cow::from(""),
            })))
            .await;
    });

    // Reader: inbound control messages.
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => handle_client_message(&state, &handle, client_msg).await,
                Err(e) => {
                    handle.queue.push(ServerMessage::error(
                        None,
                        ErrorCode::BadRequest,
                        format!("unrecognized message: {e}"),
                    ));
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                // Transport-level keepalive; axum answers pings itself.
            }
            Message::Binary(_) => {
                handle.queue.push(ServerMessage::error(
                    None,
                    ErrorCode::BadRequest,
                    "binary frames are not part of the protocol",
                ));
            }
        }
    }

    state.hub.unregister(session_id);
    writer.abort();
    tracing::info!(session_id, "session disconnected");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_client_message(
    state: &AppState,
    handle: &Arc<SessionHandle>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Ping => {
            handle.queue.push(ServerMessage::Pong);
        }

        ClientMessage::StartConversation { payload } => {
            let snapshot = state.registry.snapshot();
            let Some(domain) = snapshot.get_domain(&payload.domain_id) else {
                handle.queue.push(ServerMessage::error(
                    None,
                    ErrorCode::NotFound,
                    format!("domain {} not found", payload.domain_id),
                ));
                return;
            };
            if !domain.role_allowed(handle.identity.role) {
                handle.queue.push(ServerMessage::error(
                    None,
                    ErrorCode::Forbidden,
                    format!("role {} may not use domain {}", handle.identity.role, domain.id),
                ));
                return;
            }
            match state.store.create_conversation(
                &domain.id,
                &handle.identity.sub,
                payload.title.as_deref(),
            ) {
                Ok(conversation) => {
                    state.hub.subscribe(handle.id, &conversation.id);
                    handle.queue.push(ServerMessage::ConversationStarted {
                        conversation_id: conversation.id,
                    });
                }
                Err(e) => {
                    handle.queue.push(ServerMessage::error(
                        None,
                        ErrorCode::StreamError,
                        e.to_string(),
                    ));
                }
            }
        }

        ClientMessage::SendMessage {
            conversation_id,
            payload,
        } => {
            if state.store.get_conversation(&conversation_id).is_err() {
                handle.queue.push(ServerMessage::error(
                    Some(conversation_id.clone()),
                    ErrorCode::NotFound,
                    "conversation not found",
                ));
                return;
            }
            state.hub.subscribe(handle.id, &conversation_id);

            // One turn per conversation: reject, never queue.
            let permit = match state.turn_locks.try_acquire(&conversation_id) {
                Ok(permit) => permit,
                Err(_) => {
                    handle.queue.push(ServerMessage::error(
                        Some(conversation_id),
                        ErrorCode::Busy,
                        "a turn is already in flight",
                    ));
                    return;
                }
            };

            let input = TurnInput {
                conversation_id: conversation_id.clone(),
                user_message: payload.content,
                identity: handle.identity.clone(),
                enable_thinking: payload.enable_thinking,
                testing_override: payload.testing_override,
            };
            let (_turn_id, rx) = run_turn(state.clone(), input, permit);
            pump_turn_events(state.hub.clone(), conversation_id, rx);
        }

        ClientMessage::CancelStream { conversation_id } => {
            if !state.cancel_map.cancel(&conversation_id) {
                handle.queue.push(ServerMessage::error(
                    Some(conversation_id),
                    ErrorCode::NotFound,
                    "no active turn to cancel",
                ));
            }
        }

        ClientMessage::ApproveTool {
            conversation_id,
            request_id,
            payload,
        } => {
            if !handle.identity.role.can_approve_tools() {
                handle.queue.push(ServerMessage::error(
                    Some(conversation_id),
                    ErrorCode::Forbidden,
                    format!("role {} may not decide approvals", handle.identity.role),
                ));
                return;
            }
            // The runner emits tool_approved / tool_rejected from its own
            // event stream so ordering holds; here we only surface errors.
            if let Err(e) = state.approvals.submit_decision(
                &request_id,
                payload.approved,
                payload.reason,
                &handle.identity.sub,
            ) {
                use crate::runtime::approval::SubmitError;
                let code = match &e {
                    SubmitError::NotFound(_) => ErrorCode::NotFound,
                    SubmitError::IllegalDecision { .. } => ErrorCode::Conflict,
                    SubmitError::Store(_) => ErrorCode::StreamError,
                };
                handle.queue.push(ServerMessage::error(
                    Some(conversation_id),
                    code,
                    e.to_string(),
                ));
            }
        }
    }
}
