//! WebSocket wire protocol — tagged sum types for both directions.
//!
//! Every message is a UTF-8 JSON object with a `type` discriminant. Unknown
//! inbound tags fail to deserialize and are answered with
//! `error{bad_request}` — never silently ignored.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Close codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Invalid or missing token at handshake.
    pub const AUTH_FAILURE: u16 = 1008;
    /// Internal server error.
    pub const SERVER_ERROR: u16 = 1011;
    /// Another login for the same identity displaced this session.
    pub const IDENTITY_KICKED: u16 = 4001;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "PING")]
    Ping,

    #[serde(rename = "start_conversation")]
    StartConversation { payload: StartConversationPayload },

    #[serde(rename = "send_message")]
    SendMessage {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        payload: SendMessagePayload,
    },

    #[serde(rename = "cancel_stream")]
    CancelStream {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },

    #[serde(rename = "approve_tool")]
    ApproveTool {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ApproveToolPayload,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartConversationPayload {
    #[serde(rename = "domainId")]
    pub domain_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub content: String,
    #[serde(rename = "enableThinking", default)]
    pub enable_thinking: bool,
    /// Opt a caller into TESTING-state agents.
    #[serde(rename = "testingOverride", default)]
    pub testing_override: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveToolPayload {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server → client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "PONG")]
    Pong,

    #[serde(rename = "conversation_started")]
    ConversationStarted {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },

    #[serde(rename = "agent_selected")]
    AgentSelected {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        payload: AgentSelectedPayload,
    },

    #[serde(rename = "message_chunk")]
    MessageChunk {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        payload: MessageChunkPayload,
    },

    #[serde(rename = "message_complete")]
    MessageComplete {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        payload: MessageCompletePayload,
    },

    #[serde(rename = "tool_approval_required")]
    ToolApprovalRequired {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ToolApprovalRequiredPayload,
    },

    #[serde(rename = "tool_approved")]
    ToolApproved {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ToolApprovedPayload,
    },

    #[serde(rename = "tool_rejected")]
    ToolRejected {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ToolRejectedPayload,
    },

    #[serde(rename = "tool_executed")]
    ToolExecuted {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ToolExecutedPayload,
    },

    #[serde(rename = "workflow_handoff")]
    WorkflowHandoff {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        payload: WorkflowHandoffPayload,
    },

    #[serde(rename = "workflow_thought")]
    WorkflowThought {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        payload: WorkflowThoughtPayload,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(rename = "conversationId", skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        payload: ErrorPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSelectedPayload {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "agentName")]
    pub agent_name: String,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageChunkPayload {
    pub chunk: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageCompletePayload {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub content: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolApprovalRequiredPayload {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    pub parameters: serde_json::Value,
    #[serde(rename = "requestedBy", skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolApprovedPayload {
    #[serde(rename = "approvedBy")]
    pub approved_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolRejectedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutedPayload {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowHandoffPayload {
    #[serde(rename = "fromAgent")]
    pub from_agent: String,
    #[serde(rename = "toAgent")]
    pub to_agent: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowThoughtPayload {
    #[serde(rename = "agentName")]
    pub agent_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ServerMessage {
    /// Whether the hub may drop this event under outbound-queue pressure.
    /// Only incremental chunks and advisory thoughts are droppable;
    /// everything else must reach the client.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            ServerMessage::MessageChunk { .. } | ServerMessage::WorkflowThought { .. }
        )
    }

    pub fn error(conversation_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            conversation_id,
            payload: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_message() {
        let raw = r#"{"type":"send_message","conversationId":"c1",
                      "payload":{"content":"hello","enableThinking":false}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::SendMessage {
                conversation_id,
                payload,
            } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(payload.content, "hello");
                assert!(!payload.enable_thinking);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_approve_tool() {
        let raw = r#"{"type":"approve_tool","conversationId":"c1","requestId":"r1",
                      "payload":{"approved":true,"reason":"looks safe"}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::ApproveTool {
                request_id, payload, ..
            } => {
                assert_eq!(request_id, "r1");
                assert!(payload.approved);
                assert_eq!(payload.reason.as_deref(), Some("looks safe"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let raw = r#"{"type":"subscribe_everything"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn ping_needs_no_payload() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn server_chunk_wire_shape() {
        let msg = ServerMessage::MessageChunk {
            conversation_id: "c1".into(),
            payload: MessageChunkPayload {
                chunk: "Hel".into(),
            },
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "message_chunk");
        assert_eq!(v["conversationId"], "c1");
        assert_eq!(v["payload"]["chunk"], "Hel");
    }

    #[test]
    fn droppable_classification() {
        let chunk = ServerMessage::MessageChunk {
            conversation_id: "c".into(),
            payload: MessageChunkPayload { chunk: "x".into() },
        };
        let complete = ServerMessage::MessageComplete {
            conversation_id: "c".into(),
            payload: MessageCompletePayload {
                message_id: "m".into(),
                content: "x".into(),
                agent_id: "a".into(),
            },
        };
        let err = ServerMessage::error(None, ErrorCode::Busy, "busy");
        assert!(chunk.is_droppable());
        assert!(!complete.is_droppable());
        assert!(!err.is_droppable());
    }
}
