//! Turn execution — the per-conversation state machine.
//!
//! A turn answers one user message: persist it, route to an agent, stream
//! the model response, and on tool-call intents suspend for approval,
//! execute, and continue the stream with the result appended. Entry point:
//! [`run_turn`] spawns the loop and returns a channel of [`TurnEvent`]s.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use metrics::counter;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::Instrument;

use parley_domain::cancel::CancelToken;
use parley_domain::config::{AgentDef, DomainDef};
use parley_domain::error::ErrorCode;
use parley_domain::ids;
use parley_domain::message::{ChatMessage, ToolCall, ToolSchema};
use parley_domain::protocol::{
    AgentSelectedPayload, ErrorPayload, MessageChunkPayload, MessageCompletePayload,
    ServerMessage, ToolApprovalRequiredPayload, ToolApprovedPayload, ToolExecutedPayload,
    ToolRejectedPayload, WorkflowHandoffPayload, WorkflowThoughtPayload,
};
use parley_domain::records::{NewMessage, ToolRunStatus};
use parley_domain::registry::Snapshot;
use parley_domain::stream::{LlmEvent, StreamErrorKind};
use parley_providers::{PoolError, StreamRequest};
use parley_store::{StoreError, TransitionPatch};
use parley_tools::{ToolRegistry, HANDOFF_TOOL_ID};

use crate::auth::Identity;
use crate::metrics::{
    record_approval_wait, record_chat_message, record_first_chunk, record_turn_duration,
    TOOL_RUNS_APPROVED_TOTAL, TOOL_RUNS_EXECUTED_TOTAL, TOOL_RUNS_REQUESTED_TOTAL,
};
use crate::runtime::approval::{Decision, RegisterError, WaitOutcome};
use crate::runtime::router::{self, RouteInput};
use crate::runtime::{history_to_chat, truncate_str};
use crate::state::AppState;

/// Retry budget for retryable stream errors (idle timeout, transport).
const MAX_STREAM_RETRIES: u32 = 2;
/// First backoff; doubles per attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted while a turn runs. The hub maps them onto the wire
/// protocol; the non-streaming endpoint aggregates them.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    AgentSelected {
        agent_id: String,
        agent_name: String,
        confidence: f64,
        rationale: String,
    },
    Chunk {
        text: String,
    },
    Thought {
        agent_name: String,
        text: String,
    },
    ApprovalRequired {
        run_id: String,
        tool_name: String,
        parameters: serde_json::Value,
        requested_by: Option<String>,
    },
    ToolApproved {
        run_id: String,
        approved_by: String,
    },
    ToolRejected {
        run_id: String,
        reason: String,
    },
    ToolExecuted {
        run_id: String,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
    Handoff {
        from_agent: String,
        to_agent: String,
        reason: String,
    },
    Completed {
        message_id: String,
        content: String,
        agent_id: String,
    },
    /// The turn failed; terminal.
    Failed {
        code: ErrorCode,
        message: String,
    },
    /// The turn was cancelled; terminal.
    Cancelled,
}

impl TurnEvent {
    /// Map onto the wire protocol for one conversation's subscribers.
    pub fn into_server_message(self, conversation_id: &str) -> ServerMessage {
        let conversation_id = conversation_id.to_owned();
        match self {
            TurnEvent::AgentSelected {
                agent_id,
                agent_name,
                confidence,
                rationale,
            } => ServerMessage::AgentSelected {
                conversation_id,
                payload: AgentSelectedPayload {
                    agent_id,
                    agent_name,
                    confidence,
                    rationale,
                },
            },
            TurnEvent::Chunk { text } => ServerMessage::MessageChunk {
                conversation_id,
                payload: MessageChunkPayload { chunk: text },
            },
            TurnEvent::Thought { agent_name, text } => ServerMessage::WorkflowThought {
                conversation_id,
                payload: WorkflowThoughtPayload {
                    agent_name,
                    reason: text,
                },
            },
            TurnEvent::ApprovalRequired {
                run_id,
                tool_name,
                parameters,
                requested_by,
            } => ServerMessage::ToolApprovalRequired {
                conversation_id,
                request_id: run_id,
                payload: ToolApprovalRequiredPayload {
                    tool_name,
                    parameters,
                    requested_by,
                },
            },
            TurnEvent::ToolApproved {
                run_id,
                approved_by,
            } => ServerMessage::ToolApproved {
                conversation_id,
                request_id: run_id,
                payload: ToolApprovedPayload { approved_by },
            },
            TurnEvent::ToolRejected { run_id, reason } => ServerMessage::ToolRejected {
                conversation_id,
                request_id: run_id,
                payload: ToolRejectedPayload { reason },
            },
            TurnEvent::ToolExecuted {
                run_id,
                success,
                result,
                error,
            } => ServerMessage::ToolExecuted {
                conversation_id,
                request_id: run_id,
                payload: ToolExecutedPayload {
                    success,
                    result,
                    error,
                },
            },
            TurnEvent::Handoff {
                from_agent,
                to_agent,
                reason,
            } => ServerMessage::WorkflowHandoff {
                conversation_id,
                payload: WorkflowHandoffPayload {
                    from_agent,
                    to_agent,
                    reason,
                },
            },
            TurnEvent::Completed {
                message_id,
                content,
                agent_id,
            } => ServerMessage::MessageComplete {
                conversation_id,
                payload: MessageCompletePayload {
                    message_id,
                    content,
                    agent_id,
                },
            },
            TurnEvent::Failed { code, message } => ServerMessage::Error {
                conversation_id: Some(conversation_id),
                payload: ErrorPayload { code, message },
            },
            TurnEvent::Cancelled => ServerMessage::Error {
                conversation_id: Some(conversation_id),
                payload: ErrorPayload {
                    code: ErrorCode::Cancelled,
                    message: "turn cancelled".into(),
                },
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::Completed { .. } | TurnEvent::Failed { .. } | TurnEvent::Cancelled
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnInput {
    pub conversation_id: String,
    pub user_message: String,
    pub identity: Identity,
    pub enable_thinking: bool,
    pub testing_override: bool,
}

/// Internal failure carrying the user-visible code and any partial
/// assistant text accumulated before the failure.
struct TurnFailure {
    code: ErrorCode,
    message: String,
    partial: String,
}

impl TurnFailure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            partial: String::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start a turn. The caller must already hold the conversation's turn
/// lock; the permit moves into the runner task and releases when the turn
/// reaches a terminal state.
pub fn run_turn(
    state: AppState,
    input: TurnInput,
    permit: OwnedSemaphorePermit,
) -> (String, mpsc::Receiver<TurnEvent>) {
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);
    let turn_id = ids::new_id();
    let cancel = state.cancel_map.register(&input.conversation_id);
    let conversation_id = input.conversation_id.clone();

    let span = tracing::info_span!(
        "turn",
        turn_id = %turn_id,
        conversation_id = %conversation_id,
        sub = %input.identity.sub,
    );
    let task_turn_id = turn_id.clone();
    tokio::spawn(
        async move {
            let _permit = permit;
            let started = Instant::now();
            tracing::debug!("turn started");

            let result =
                run_turn_inner(&state, &input, &task_turn_id, &tx, &cancel).await;
            state.cancel_map.remove(&input.conversation_id);
            record_turn_duration(started.elapsed().as_millis() as f64);

            if let Err(failure) = result {
                tracing::warn!(code = %failure.code, message = %failure.message, "turn failed");
                // Persist what we have, tagged with the error code.
                if !failure.partial.is_empty() {
                    let msg = NewMessage {
                        role: parley_domain::records::MessageRole::Assistant,
                        content: failure.partial.clone(),
                        agent_id: None,
                        metadata: Some(serde_json::json!({ "error": failure.code })),
                    };
                    if let Err(e) = state.store.append_message(&input.conversation_id, msg) {
                        tracing::error!(error = %e, "failed to persist failure message");
                    }
                }
                let _ = tx
                    .send(TurnEvent::Failed {
                        code: failure.code,
                        message: failure.message,
                    })
                    .await;
            }
        }
        .instrument(span),
    );

    (turn_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inner loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of consuming one LLM stream to its terminal event.
enum StreamOutcome {
    /// Stream finished; text plus any collected tool-call intents.
    Finished {
        text: String,
        intents: Vec<ToolCall>,
    },
    Cancelled {
        partial: String,
    },
}

/// What to do after handling the intents of one stream.
enum NextStep {
    /// Continue the LLM with tool results appended (STREAMING_CONT).
    Continue,
    /// The model switched agents; restart with the new system prompt.
    Handoff { to: Arc<AgentDef> },
    CancelledDuringTools {
        partial: String,
    },
}

async fn run_turn_inner(
    state: &AppState,
    input: &TurnInput,
    turn_id: &str,
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
) -> Result<(), TurnFailure> {
    let snapshot = state.registry.snapshot();

    // ── Resolve conversation and domain ─────────────────────────────
    let conversation = state
        .store
        .get_conversation(&input.conversation_id)
        .map_err(|e| match e {
            StoreError::NotFound(_) => TurnFailure::new(
                ErrorCode::NotFound,
                format!("conversation {} not found", input.conversation_id),
            ),
            other => TurnFailure::new(ErrorCode::StreamError, other.to_string()),
        })?;
    let domain = snapshot.get_domain(&conversation.domain_id).ok_or_else(|| {
        TurnFailure::new(
            ErrorCode::NotConfigured,
            format!("domain {} is not loaded", conversation.domain_id),
        )
    })?;
    if !domain.role_allowed(input.identity.role) {
        return Err(TurnFailure::new(
            ErrorCode::Forbidden,
            format!("role {} may not use domain {}", input.identity.role, domain.id),
        ));
    }

    // ── Persist the user message ────────────────────────────────────
    let user_msg = state
        .store
        .append_message(
            &input.conversation_id,
            NewMessage::user(input.user_message.clone()),
        )
        .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;
    record_chat_message("user");
    tracing::debug!(seq = user_msg.seq, "user message persisted");

    // ── ROUTING ─────────────────────────────────────────────────────
    let history = state
        .store
        .list_messages(&input.conversation_id, None)
        .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;

    let route_input = RouteInput {
        domain: &domain,
        snapshot: &snapshot,
        user_message: &input.user_message,
        history: &history,
        requester_role: input.identity.role,
        testing_override: input.testing_override,
    };
    let decision = router::route(&route_input, &state.pool)
        .await
        .map_err(|e| TurnFailure::new(ErrorCode::NotConfigured, e.to_string()))?;

    let mut agent = snapshot.get_agent(&decision.agent_id).ok_or_else(|| {
        TurnFailure::new(
            ErrorCode::NotConfigured,
            format!("agent {} disappeared after routing", decision.agent_id),
        )
    })?;
    if let Err(e) = state.store.set_initial_agent(&input.conversation_id, &agent.id) {
        tracing::warn!(error = %e, "failed to record initial agent");
    }

    let _ = tx
        .send(TurnEvent::AgentSelected {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            confidence: decision.confidence,
            rationale: decision.rationale.clone(),
        })
        .await;
    tracing::info!(agent_id = %agent.id, strategy = decision.strategy, "agent selected");

    // ── STREAMING / tool loop ───────────────────────────────────────
    let tools = state.tools.current();
    let mut messages = history_to_chat(&history);
    let mut handoffs: u32 = 0;

    loop {
        let outcome =
            stream_once(state, input, &agent, &tools, &domain, &messages, tx, cancel).await?;

        let (text, intents) = match outcome {
            StreamOutcome::Cancelled { partial } => {
                return finish_cancelled(state, input, &agent, tx, &partial).await;
            }
            StreamOutcome::Finished { text, intents } => (text, intents),
        };

        // ── No intents: the stream was the final answer ─────────────
        if intents.is_empty() {
            return finish_completed(state, input, &agent, tx, text).await;
        }

        // ── Persist the assistant segment that requested the tools ──
        messages.push(ChatMessage::assistant_with_calls(&text, &intents));
        if !text.is_empty() {
            let call_ids: Vec<_> = intents.iter().map(|c| c.call_id.clone()).collect();
            let msg = NewMessage::assistant(text.clone(), agent.id.clone())
                .with_metadata(serde_json::json!({ "tool_calls": call_ids }));
            if let Err(e) = state.store.append_message(&input.conversation_id, msg) {
                tracing::warn!(error = %e, "failed to persist assistant tool segment");
            } else {
                record_chat_message("assistant");
            }
        }

        match handle_intents(
            state, input, turn_id, &snapshot, &domain, &agent, &tools, &mut messages, intents,
            &mut handoffs, tx, cancel,
        )
        .await?
        {
            NextStep::Continue => continue,
            NextStep::Handoff { to } => {
                agent = to;
                continue;
            }
            NextStep::CancelledDuringTools { partial } => {
                return finish_cancelled(state, input, &agent, tx, &partial).await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming with retries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn llm_tool_schemas(
    tools: &ToolRegistry,
    domain: &DomainDef,
    agent: &AgentDef,
) -> Vec<ToolSchema> {
    let mut schemas = tools.llm_schemas(&agent.tool_ids);
    // The handoff pseudo-tool is available whenever there is another agent
    // to hand off to.
    if domain.agent_ids.len() > 1 {
        schemas.push(ToolSchema {
            name: HANDOFF_TOOL_ID.into(),
            description: "Hand the conversation to another agent better suited to continue."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "to_agent_id": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["to_agent_id"]
            }),
        });
    }
    schemas
}

#[allow(clippy::too_many_arguments)]
async fn stream_once(
    state: &AppState,
    input: &TurnInput,
    agent: &AgentDef,
    tools: &ToolRegistry,
    domain: &DomainDef,
    messages: &[ChatMessage],
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
) -> Result<StreamOutcome, TurnFailure> {
    let mut attempts: u32 = 0;

    'retry: loop {
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled {
                partial: String::new(),
            });
        }

        let lease = state.pool.acquire(&agent.model_id).await.map_err(|e| match e {
            PoolError::Overloaded(model) => TurnFailure::new(
                ErrorCode::Overloaded,
                format!("admission queue full for model {model}"),
            ),
            PoolError::UnknownModel(model) => TurnFailure::new(
                ErrorCode::NotConfigured,
                format!("no LLM client for model {model}"),
            ),
        })?;

        let request = StreamRequest {
            model_id: agent.model_id.clone(),
            system_prompt: agent.system_prompt.clone(),
            messages: messages.to_vec(),
            tools: llm_tool_schemas(tools, domain, agent),
        };

        let request_started = Instant::now();
        let mut stream = match lease.client.stream(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) if attempts < MAX_STREAM_RETRIES => {
                attempts += 1;
                let backoff = RETRY_BACKOFF * 2u32.pow(attempts - 1);
                tracing::warn!(error = %e, attempt = attempts, "stream open failed; retrying");
                tokio::time::sleep(backoff).await;
                continue 'retry;
            }
            Err(e) => {
                return Err(TurnFailure::new(ErrorCode::StreamError, e.to_string()));
            }
        };

        let mut text = String::new();
        let mut intents: Vec<ToolCall> = Vec::new();
        let mut first_chunk_seen = false;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(StreamOutcome::Cancelled { partial: text });
            }
            match event {
                LlmEvent::TokenChunk { text: chunk } => {
                    if !first_chunk_seen {
                        first_chunk_seen = true;
                        record_first_chunk(
                            request_started.elapsed().as_millis() as f64
                        );
                    }
                    text.push_str(&chunk);
                    let _ = tx.send(TurnEvent::Chunk { text: chunk }).await;
                }
                LlmEvent::Thinking { text: thought } => {
                    if input.enable_thinking {
                        let _ = tx
                            .send(TurnEvent::Thought {
                                agent_name: agent.name.clone(),
                                text: thought,
                            })
                            .await;
                    }
                }
                LlmEvent::ToolCallIntent {
                    call_id,
                    tool_id,
                    arguments,
                } => {
                    intents.push(ToolCall {
                        call_id,
                        tool_id,
                        arguments,
                    });
                }
                LlmEvent::Completed { .. } => {
                    return Ok(StreamOutcome::Finished { text, intents });
                }
                LlmEvent::StreamError {
                    kind: StreamErrorKind::Cancelled,
                    ..
                } => {
                    return Ok(StreamOutcome::Cancelled { partial: text });
                }
                LlmEvent::StreamError {
                    retryable,
                    message,
                    kind,
                } => {
                    if retryable && attempts < MAX_STREAM_RETRIES {
                        attempts += 1;
                        let backoff = RETRY_BACKOFF * 2u32.pow(attempts - 1);
                        tracing::warn!(
                            ?kind,
                            attempt = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            "retryable stream error; restarting with same prompt"
                        );
                        tokio::time::sleep(backoff).await;
                        continue 'retry;
                    }
                    let mut failure =
                        TurnFailure::new(ErrorCode::StreamError, message);
                    failure.partial = text;
                    return Err(failure);
                }
            }
        }

        // Stream ended without a terminal event (adapter bug). Treat the
        // accumulated text as the answer rather than hanging the turn.
        tracing::warn!("LLM stream ended without terminal event");
        return Ok(StreamOutcome::Finished { text, intents });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Intent handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(serde::Deserialize)]
struct HandoffArgs {
    to_agent_id: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Feed a pre-execution failure back to the model and persist it, without
/// aborting the turn.
async fn push_tool_failure(
    state: &AppState,
    input: &TurnInput,
    messages: &mut Vec<ChatMessage>,
    call: &ToolCall,
    code: ErrorCode,
    detail: String,
) {
    tracing::debug!(tool_id = %call.tool_id, %code, detail = %detail, "tool request refused");
    let content = format!("{code}: {detail}");
    messages.push(ChatMessage::tool_result(&call.call_id, &content, true));
    let msg = NewMessage::tool_result(
        content,
        serde_json::json!({
            "call_id": call.call_id,
            "tool_id": call.tool_id,
            "is_error": true,
            "error": code,
        }),
    );
    if let Err(e) = state.store.append_message(&input.conversation_id, msg) {
        tracing::warn!(error = %e, "failed to persist tool failure message");
    } else {
        record_chat_message("tool_result");
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_intents(
    state: &AppState,
    input: &TurnInput,
    turn_id: &str,
    snapshot: &Snapshot,
    domain: &DomainDef,
    agent: &Arc<AgentDef>,
    tools: &ToolRegistry,
    messages: &mut Vec<ChatMessage>,
    intents: Vec<ToolCall>,
    handoffs: &mut u32,
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
) -> Result<NextStep, TurnFailure> {
    for call in intents {
        if cancel.is_cancelled() {
            return Ok(NextStep::CancelledDuringTools {
                partial: String::new(),
            });
        }

        // ── Handoff sentinel ────────────────────────────────────────
        if call.tool_id == HANDOFF_TOOL_ID {
            let cap = domain.effective_max_handoffs(state.settings.max_handoffs);
            *handoffs += 1;
            if *handoffs > cap {
                return Err(TurnFailure::new(
                    ErrorCode::HandoffLoop,
                    format!("exceeded max_handoffs={cap}"),
                ));
            }
            let args: HandoffArgs = match serde_json::from_value(call.arguments.clone()) {
                Ok(args) => args,
                Err(e) => {
                    push_tool_failure(
                        state,
                        input,
                        messages,
                        &call,
                        ErrorCode::ToolRequestFailed,
                        format!("bad handoff arguments: {e}"),
                    )
                    .await;
                    continue;
                }
            };
            let target = snapshot
                .get_agent(&args.to_agent_id)
                .filter(|a| a.domain_id == domain.id)
                .filter(|a| a.state.is_routable(input.testing_override));
            let Some(target) = target else {
                push_tool_failure(
                    state,
                    input,
                    messages,
                    &call,
                    ErrorCode::ToolRequestFailed,
                    format!("agent {} is not available for handoff", args.to_agent_id),
                )
                .await;
                continue;
            };

            let reason = args.reason.unwrap_or_else(|| "handoff".into());
            tracing::info!(from = %agent.id, to = %target.id, handoffs = *handoffs, "workflow handoff");
            let _ = tx
                .send(TurnEvent::Handoff {
                    from_agent: agent.id.clone(),
                    to_agent: target.id.clone(),
                    reason: reason.clone(),
                })
                .await;
            messages.push(ChatMessage::tool_result(
                &call.call_id,
                format!("conversation handed to {}", target.id),
                false,
            ));
            return Ok(NextStep::Handoff { to: target });
        }

        // ── Validation & role gate (before any ToolRun exists) ──────
        if !agent.tool_ids.iter().any(|id| id == &call.tool_id) || tools.get(&call.tool_id).is_none()
        {
            push_tool_failure(
                state,
                input,
                messages,
                &call,
                ErrorCode::ToolRequestFailed,
                format!("tool {} is not available to agent {}", call.tool_id, agent.id),
            )
            .await;
            continue;
        }
        if !tools.is_role_allowed(&call.tool_id, input.identity.role) {
            push_tool_failure(
                state,
                input,
                messages,
                &call,
                ErrorCode::ToolRequestFailed,
                format!(
                    "role {} is not allowed to invoke {}",
                    input.identity.role, call.tool_id
                ),
            )
            .await;
            continue;
        }
        let args = match tools.validate(&call.tool_id, &call.arguments) {
            Ok(args) => args,
            Err(e) => {
                push_tool_failure(
                    state,
                    input,
                    messages,
                    &call,
                    ErrorCode::ToolRequestFailed,
                    e.to_string(),
                )
                .await;
                continue;
            }
        };

        // ── Persist the run (PENDING) ───────────────────────────────
        let run = state
            .store
            .create_tool_run(
                &input.conversation_id,
                turn_id,
                &call.tool_id,
                Some(agent.id.as_str()),
                args.clone(),
            )
            .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;
        counter!(TOOL_RUNS_REQUESTED_TOTAL).increment(1);
        let requires_approval = tools
            .get(&call.tool_id)
            .map(|def| def.requires_approval)
            .unwrap_or(true);

        // ── AWAITING_APPROVAL ───────────────────────────────────────
        let approved_by = if requires_approval {
            let rx = state.approvals.register(&run.id).map_err(|e| match e {
                RegisterError::DuplicateWaiter(id) => TurnFailure::new(
                    ErrorCode::StreamError,
                    format!("duplicate approval waiter for run {id}"),
                ),
            })?;
            let _ = tx
                .send(TurnEvent::ApprovalRequired {
                    run_id: run.id.clone(),
                    tool_name: call.tool_id.clone(),
                    parameters: args.clone(),
                    requested_by: Some(agent.id.clone()),
                })
                .await;

            let wait_started = Instant::now();
            let outcome = state.approvals.await_decision(&run.id, rx, cancel).await;
            record_approval_wait(wait_started.elapsed().as_millis() as f64);

            match outcome {
                WaitOutcome::Cancelled => {
                    // Reject the pending run; a racing decision makes the
                    // CAS a no-op, which is fine.
                    let _ = state.store.transition_tool_run(
                        &run.id,
                        ToolRunStatus::Pending,
                        ToolRunStatus::Rejected,
                        TransitionPatch {
                            rejection_reason: Some("cancelled".into()),
                            ..TransitionPatch::by("system").with_reason("cancelled")
                        },
                    );
                    return Ok(NextStep::CancelledDuringTools {
                        partial: String::new(),
                    });
                }
                WaitOutcome::TimedOut => {
                    let _ = tx
                        .send(TurnEvent::ToolRejected {
                            run_id: run.id.clone(),
                            reason: "timeout".into(),
                        })
                        .await;
                    push_rejection_result(state, input, messages, &call, "timeout").await;
                    continue;
                }
                WaitOutcome::Decision(Decision::Rejected { reason, .. }) => {
                    let _ = tx
                        .send(TurnEvent::ToolRejected {
                            run_id: run.id.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    push_rejection_result(state, input, messages, &call, &reason).await;
                    continue;
                }
                WaitOutcome::Decision(Decision::Approved { approver_sub }) => {
                    let _ = tx
                        .send(TurnEvent::ToolApproved {
                            run_id: run.id.clone(),
                            approved_by: approver_sub.clone(),
                        })
                        .await;
                    approver_sub
                }
            }
        } else {
            // Auto-approval still walks the status DAG so the audit trail
            // is uniform.
            state
                .store
                .transition_tool_run(
                    &run.id,
                    ToolRunStatus::Pending,
                    ToolRunStatus::Approved,
                    TransitionPatch {
                        approved_by_sub: Some("auto".into()),
                        ..TransitionPatch::by("auto")
                    },
                )
                .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;
            counter!(TOOL_RUNS_APPROVED_TOTAL).increment(1);
            let _ = tx
                .send(TurnEvent::ToolApproved {
                    run_id: run.id.clone(),
                    approved_by: "auto".into(),
                })
                .await;
            "auto".to_string()
        };

        // ── EXECUTING_TOOL ──────────────────────────────────────────
        state
            .store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Approved,
                ToolRunStatus::Executing,
                TransitionPatch::by("system"),
            )
            .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;
        tracing::info!(run_id = %run.id, tool_id = %call.tool_id, approved_by = %approved_by, "executing tool");

        let exec_result = tools
            .execute(&call.tool_id, &run.id, args, cancel.clone())
            .await;

        let (success, result_value, error_text, content) = match exec_result {
            Ok(value) => {
                state
                    .store
                    .transition_tool_run(
                        &run.id,
                        ToolRunStatus::Executing,
                        ToolRunStatus::Executed,
                        TransitionPatch {
                            result: Some(value.clone()),
                            ..TransitionPatch::by("system")
                        },
                    )
                    .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;
                counter!(TOOL_RUNS_EXECUTED_TOTAL).increment(1);
                let content = value.to_string();
                (true, Some(value), None, content)
            }
            Err(e) => {
                let error_text = e.to_string();
                state
                    .store
                    .transition_tool_run(
                        &run.id,
                        ToolRunStatus::Executing,
                        ToolRunStatus::Failed,
                        TransitionPatch {
                            error: Some(error_text.clone()),
                            ..TransitionPatch::by("system").with_reason(error_text.clone())
                        },
                    )
                    .map_err(|e| TurnFailure::new(ErrorCode::StreamError, e.to_string()))?;
                let content = format!("tool_execute_failed: {error_text}");
                (false, None, Some(error_text), content)
            }
        };

        // Persist the tool result either way; stream it only if the turn
        // was not cancelled while the handler ran.
        let msg = NewMessage::tool_result(
            content.clone(),
            serde_json::json!({
                "call_id": call.call_id,
                "tool_id": call.tool_id,
                "run_id": run.id,
                "is_error": !success,
            }),
        );
        if let Err(e) = state.store.append_message(&input.conversation_id, msg) {
            tracing::warn!(error = %e, "failed to persist tool result message");
        } else {
            record_chat_message("tool_result");
        }
        messages.push(ChatMessage::tool_result(&call.call_id, &content, !success));

        if cancel.is_cancelled() {
            tracing::info!(run_id = %run.id, "turn cancelled during tool execution; result persisted, not streamed");
            return Ok(NextStep::CancelledDuringTools {
                partial: String::new(),
            });
        }

        let _ = tx
            .send(TurnEvent::ToolExecuted {
                run_id: run.id.clone(),
                success,
                result: result_value,
                error: error_text,
            })
            .await;
    }

    Ok(NextStep::Continue)
}

/// Persist and feed back a rejection so the agent can explain itself.
async fn push_rejection_result(
    state: &AppState,
    input: &TurnInput,
    messages: &mut Vec<ChatMessage>,
    call: &ToolCall,
    reason: &str,
) {
    let content = format!("tool request rejected: {reason}");
    messages.push(ChatMessage::tool_result(&call.call_id, &content, true));
    let msg = NewMessage::tool_result(
        content,
        serde_json::json!({
            "call_id": call.call_id,
            "tool_id": call.tool_id,
            "is_error": true,
            "rejected": true,
        }),
    );
    if let Err(e) = state.store.append_message(&input.conversation_id, msg) {
        tracing::warn!(error = %e, "failed to persist rejection message");
    } else {
        record_chat_message("tool_result");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal states
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// COMPLETED: persist the final assistant message (one retry on store
/// failure) and emit `message_complete`.
async fn finish_completed(
    state: &AppState,
    input: &TurnInput,
    agent: &AgentDef,
    tx: &mpsc::Sender<TurnEvent>,
    text: String,
) -> Result<(), TurnFailure> {
    let msg = NewMessage::assistant(text.clone(), agent.id.clone());
    let stored = match state.store.append_message(&input.conversation_id, msg) {
        Ok(stored) => stored,
        Err(first_err) => {
            tracing::warn!(error = %first_err, "final append failed; retrying once");
            let retry = NewMessage::assistant(text.clone(), agent.id.clone());
            state
                .store
                .append_message(&input.conversation_id, retry)
                .map_err(|e| {
                    let mut failure = TurnFailure::new(ErrorCode::StreamError, e.to_string());
                    failure.partial = text.clone();
                    failure
                })?
        }
    };
    record_chat_message("assistant");

    tracing::info!(
        message_id = %stored.id,
        preview = %truncate_str(&text, 80),
        "turn completed"
    );
    let _ = tx
        .send(TurnEvent::Completed {
            message_id: stored.id,
            content: text,
            agent_id: agent.id.to_string(),
        })
        .await;
    Ok(())
}

/// CANCELLED: keep whatever streamed so far, marked partial.
async fn finish_cancelled(
    state: &AppState,
    input: &TurnInput,
    agent: &AgentDef,
    tx: &mpsc::Sender<TurnEvent>,
    partial: &str,
) -> Result<(), TurnFailure> {
    if !partial.is_empty() {
        let msg = NewMessage::assistant(partial.to_owned(), agent.id.clone())
            .with_metadata(serde_json::json!({ "partial": true }));
        if let Err(e) = state.store.append_message(&input.conversation_id, msg) {
            tracing::warn!(error = %e, "failed to persist partial message");
        } else {
            record_chat_message("assistant");
        }
    }
    tracing::info!(partial_len = partial.len(), "turn cancelled");
    let _ = tx.send(TurnEvent::Cancelled).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::config::Role;

    #[test]
    fn terminal_events() {
        assert!(TurnEvent::Cancelled.is_terminal());
        assert!(TurnEvent::Failed {
            code: ErrorCode::Busy,
            message: "x".into()
        }
        .is_terminal());
        assert!(!TurnEvent::Chunk { text: "x".into() }.is_terminal());
    }

    #[test]
    fn cancelled_maps_to_error_code_cancelled() {
        let msg = TurnEvent::Cancelled.into_server_message("c1");
        match msg {
            ServerMessage::Error {
                conversation_id,
                payload,
            } => {
                assert_eq!(conversation_id.as_deref(), Some("c1"));
                assert_eq!(payload.code, ErrorCode::Cancelled);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn chunk_maps_to_message_chunk() {
        let msg = TurnEvent::Chunk {
            text: "hi".into(),
        }
        .into_server_message("c1");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "message_chunk");
        assert_eq!(v["payload"]["chunk"], "hi");
    }

    #[test]
    fn identity_is_cloneable_into_input() {
        let input = TurnInput {
            conversation_id: "c".into(),
            user_message: "hello".into(),
            identity: Identity {
                sub: "alice".into(),
                role: Role::User,
            },
            enable_thinking: false,
            testing_override: false,
        };
        assert_eq!(input.identity.sub, "alice");
    }
}
