//! Core runtime — routing, turn execution, approval rendezvous, and the
//! per-conversation concurrency primitives.
//!
//! Entry point: [`turn::run_turn`] takes a conversation + user message and
//! returns a channel of [`turn::TurnEvent`]s that the session hub (or the
//! non-streaming REST endpoint) consumes.

pub mod approval;
pub mod cancel;
pub mod router;
pub mod turn;
pub mod turn_lock;

pub use turn::{run_turn, TurnEvent, TurnInput};

use parley_domain::message::{ChatMessage, ChatRole};
use parley_domain::records::{MessageRole, StoredMessage};

/// Convert persisted history into the LLM conversation. Tool-result rows
/// need their `call_id` from metadata to pair with the assistant's tool
/// use; rows without one are skipped.
pub(crate) fn history_to_chat(history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len());
    for row in history {
        match row.role {
            MessageRole::User => messages.push(ChatMessage::user(row.content.clone())),
            MessageRole::Assistant => messages.push(ChatMessage::assistant(row.content.clone())),
            MessageRole::System => messages.push(ChatMessage {
                role: ChatRole::System,
                content: parley_domain::message::ChatContent::Text(row.content.clone()),
            }),
            MessageRole::ToolResult => {
                let call_id = row
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("call_id"))
                    .and_then(|v| v.as_str());
                if let Some(call_id) = call_id {
                    let is_error = row
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("is_error"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    messages.push(ChatMessage::tool_result(call_id, row.content.clone(), is_error));
                }
            }
        }
    }
    messages
}

pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(role: MessageRole, content: &str, metadata: Option<serde_json::Value>) -> StoredMessage {
        StoredMessage {
            id: "m".into(),
            conversation_id: "c".into(),
            seq: 1,
            role,
            content: content.into(),
            agent_id: None,
            created_at: chrono::Utc::now(),
            metadata,
        }
    }

    #[test]
    fn history_maps_roles() {
        let history = vec![
            row(MessageRole::User, "question", None),
            row(MessageRole::Assistant, "answer", None),
            row(
                MessageRole::ToolResult,
                "data",
                Some(serde_json::json!({"call_id": "c1", "is_error": false})),
            ),
        ];
        let chat = history_to_chat(&history);
        assert_eq!(chat.len(), 3);
        assert_eq!(chat[0].role, ChatRole::User);
        assert_eq!(chat[1].role, ChatRole::Assistant);
        assert_eq!(chat[2].role, ChatRole::Tool);
    }

    #[test]
    fn tool_results_without_call_id_are_skipped() {
        let history = vec![row(MessageRole::ToolResult, "orphan", None)];
        assert!(history_to_chat(&history).is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        // Two-byte char at the cut point.
        assert_eq!(truncate_str("h\u{00e9}llo", 2), "h...");
    }
}
