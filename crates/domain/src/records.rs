//! Persisted entities: conversations, messages, tool runs, and the audit
//! rows written on every tool-run transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    ReviewRequested,
    Merged,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::ReviewRequested => "review_requested",
            ConversationStatus::Merged => "merged",
            ConversationStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub domain_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub creator_sub: String,
    pub status: ConversationStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    ToolResult,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::ToolResult => "tool_result",
        }
    }
}

/// One persisted conversation message. `seq` is strictly increasing per
/// conversation and breaks `created_at` ties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A new message, before the store assigns id/seq/created_at.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub agent_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            agent_id: None,
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            agent_id: Some(agent_id.into()),
            metadata: None,
        }
    }

    pub fn tool_result(content: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            role: MessageRole::ToolResult,
            content: content.into(),
            agent_id: None,
            metadata: Some(metadata),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-run status. Transitions:
/// PENDING → (APPROVED | REJECTED); APPROVED → EXECUTING → (EXECUTED |
/// FAILED). Terminal states absorb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolRunStatus {
    Pending,
    Approved,
    Rejected,
    Executing,
    Executed,
    Failed,
}

impl ToolRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolRunStatus::Pending => "PENDING",
            ToolRunStatus::Approved => "APPROVED",
            ToolRunStatus::Rejected => "REJECTED",
            ToolRunStatus::Executing => "EXECUTING",
            ToolRunStatus::Executed => "EXECUTED",
            ToolRunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolRunStatus::Rejected | ToolRunStatus::Executed | ToolRunStatus::Failed
        )
    }

    /// Whether `self → to` is a permitted status transition.
    pub fn can_transition_to(self, to: ToolRunStatus) -> bool {
        use ToolRunStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Executing)
                | (Executing, Executed)
                | (Executing, Failed)
        )
    }
}

impl std::str::FromStr for ToolRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ToolRunStatus::Pending),
            "APPROVED" => Ok(ToolRunStatus::Approved),
            "REJECTED" => Ok(ToolRunStatus::Rejected),
            "EXECUTING" => Ok(ToolRunStatus::Executing),
            "EXECUTED" => Ok(ToolRunStatus::Executed),
            "FAILED" => Ok(ToolRunStatus::Failed),
            other => Err(format!("unknown tool run status: {other}")),
        }
    }
}

/// A persisted record of one attempted tool invocation. Kept forever for
/// audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRun {
    pub id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub tool_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by_agent_id: Option<String>,
    pub parameters: serde_json::Value,
    pub status: ToolRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by_sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool-run state transition, as written to `workflow_logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLog {
    pub id: i64,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_status: Option<ToolRunStatus>,
    pub to_status: ToolRunStatus,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
