//! Provider-agnostic chat messages exchanged with the LLM backend.

use serde::{Deserialize, Serialize};

/// A fully-assembled tool invocation request from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_id: String,
    pub arguments: serde_json::Value,
}

/// A tool made visible to the LLM: name + description + parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: ChatContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: ChatContent::Text(text.into()),
        }
    }

    /// An assistant message carrying text (if any) plus tool-use parts.
    pub fn assistant_with_calls(text: &str, calls: &[ToolCall]) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ChatPart::Text { text: text.into() });
        }
        for call in calls {
            parts.push(ChatPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_id.clone(),
                input: call.arguments.clone(),
            });
        }
        Self {
            role: ChatRole::Assistant,
            content: ChatContent::Parts(parts),
        }
    }

    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: ChatContent::Parts(vec![ChatPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }]),
        }
    }
}

impl ChatContent {
    /// Join all text content into one owned string. Non-text parts are
    /// skipped.
    pub fn joined_text(&self) -> String {
        match self {
            ChatContent::Text(t) => t.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ChatPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_calls_skips_empty_text() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_id: "file_write".into(),
            arguments: serde_json::json!({"path": "a.txt"}),
        }];
        let msg = ChatMessage::assistant_with_calls("", &calls);
        match &msg.content {
            ChatContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(parts[0], ChatPart::ToolUse { .. }));
            }
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn assistant_with_calls_keeps_text_first() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_id: "file_read".into(),
            arguments: serde_json::json!({}),
        }];
        let msg = ChatMessage::assistant_with_calls("reading...", &calls);
        match &msg.content {
            ChatContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[0], ChatPart::Text { text } if text == "reading..."));
            }
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn joined_text_over_parts() {
        let content = ChatContent::Parts(vec![
            ChatPart::Text { text: "one".into() },
            ChatPart::ToolUse {
                id: "c".into(),
                name: "t".into(),
                input: serde_json::json!({}),
            },
            ChatPart::Text { text: "two".into() },
        ]);
        assert_eq!(content.joined_text(), "one\ntwo");
    }

    #[test]
    fn tool_result_round_trips() {
        let msg = ChatMessage::tool_result("c9", "ok", false);
        let json = serde_json::to_value(&msg).unwrap();
        let back: ChatMessage = serde_json::from_value(json).unwrap();
        match back.content {
            ChatContent::Parts(parts) => match &parts[0] {
                ChatPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    assert_eq!(tool_use_id, "c9");
                    assert_eq!(content, "ok");
                    assert!(!is_error);
                }
                _ => panic!("expected tool_result part"),
            },
            _ => panic!("expected parts"),
        }
    }
}
