//! Domain, agent, and tool definitions — the reloadable configuration that
//! drives routing and tool dispatch.
//!
//! Definitions are loaded from a single TOML file (`[[domains]]`,
//! `[[agents]]`, `[[tools]]` tables) and assembled into an immutable
//! snapshot by [`crate::registry::ConfigRegistry`]. Referential integrity
//! is checked at snapshot build time, not here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caller roles. The role→permission table itself lives with the auth
/// collaborator; definitions only reference roles by name in
/// `allowed_roles` gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Developer,
    Operator,
    User,
    Agent,
    Guest,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Developer => "developer",
            Role::Operator => "operator",
            Role::User => "user",
            Role::Agent => "agent",
            Role::Guest => "guest",
        }
    }

    /// Roles trusted to decide tool approvals.
    pub fn can_approve_tools(self) -> bool {
        matches!(self, Role::Admin | Role::Developer | Role::Operator)
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "developer" => Ok(Role::Developer),
            "operator" => Ok(Role::Operator),
            "user" => Ok(Role::User),
            "agent" => Ok(Role::Agent),
            "guest" => Ok(Role::Guest),
            other => Err(Error::Config(format!("unknown role: {other}"))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a domain selects the agent for a turn. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// Keyword scoring over routing rules.
    Supervisor,
    /// Fixed pipeline: agent N handles turn N (mod pipeline length).
    Orchestrator,
    /// An LLM router primed with example decisions.
    FewShot,
    /// Per-phase mix of deterministic pipeline steps and LLM decisions.
    Hybrid,
}

impl WorkflowType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowType::Supervisor => "supervisor",
            WorkflowType::Orchestrator => "orchestrator",
            WorkflowType::FewShot => "few_shot",
            WorkflowType::Hybrid => "hybrid",
        }
    }
}

/// Marker for one hybrid phase: resolved from the pipeline, or delegated
/// to the LLM router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridPhase {
    Deterministic,
    Llm,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Agent lifecycle state. Transitions form a DAG:
/// DEVELOPMENT↔TESTING, TESTING→PRODUCTION, PRODUCTION→DEPRECATED→ARCHIVED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Development,
    Testing,
    Production,
    Deprecated,
    Archived,
}

impl AgentState {
    /// Whether `self → to` is a permitted lifecycle transition.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, to),
            (Development, Testing)
                | (Testing, Development)
                | (Testing, Production)
                | (Production, Deprecated)
                | (Deprecated, Archived)
        )
    }

    /// Whether new turns may be routed to an agent in this state.
    /// TESTING requires the caller to carry an explicit override.
    pub fn is_routable(self, testing_override: bool) -> bool {
        match self {
            AgentState::Production => true,
            AgentState::Testing => testing_override,
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One keyword routing rule inside a domain. Higher priority wins when
/// several keywords match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub keyword: String,
    pub agent_id: String,
    #[serde(default = "default_priority")]
    pub priority: f64,
}

fn default_priority() -> f64 {
    1.0
}

/// One example decision for the few-shot LLM router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub user_message: String,
    pub agent_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A domain: a set of agents plus the routing policy that picks between
/// them. Immutable between reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDef {
    pub id: String,
    pub name: String,
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    pub default_agent_id: String,
    #[serde(default)]
    pub fallback_agent_id: Option<String>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    /// Empty = any authenticated role may use this domain.
    #[serde(default)]
    pub allowed_roles: Vec<Role>,
    /// Ordered pipeline for `orchestrator` (and `hybrid` deterministic
    /// phases).
    #[serde(default)]
    pub orchestration_pipeline: Vec<String>,
    #[serde(default)]
    pub few_shot_examples: Vec<FewShotExample>,
    /// Per-phase markers for `hybrid`. Empty behaves as `few_shot`.
    #[serde(default)]
    pub hybrid_phases: Vec<HybridPhase>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: u32,
}

fn default_min_confidence() -> f64 {
    0.2
}

fn default_max_handoffs() -> u32 {
    5
}

impl DomainDef {
    pub fn role_allowed(&self, role: Role) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(&role)
    }

    /// The handoff cap for this domain. `0` means "not set here", falling
    /// back to the process-wide default.
    pub fn effective_max_handoffs(&self, global_default: u32) -> u32 {
        if self.max_handoffs == 0 {
            global_default.max(1)
        } else {
            self.max_handoffs
        }
    }
}

/// An agent: model + system prompt + tool set + routing keywords.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDef {
    pub id: String,
    pub name: String,
    pub model_id: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_agent_state")]
    pub state: AgentState,
    #[serde(default = "default_version")]
    pub version: String,
    pub domain_id: String,
}

fn default_agent_state() -> AgentState {
    AgentState::Development
}

fn default_version() -> String {
    "0.1.0".into()
}

/// A tool: a JSON-Schema-validated, role-gated operation the model may
/// request. `handler_ref` names the registered handler implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters_schema: serde_json::Value,
    #[serde(default)]
    pub returns_schema: Option<serde_json::Value>,
    pub handler_ref: String,
    #[serde(default)]
    pub requires_approval: bool,
    /// Empty = any role may invoke.
    #[serde(default)]
    pub allowed_roles: Vec<Role>,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

impl ToolDef {
    pub fn role_allowed(&self, role: Role) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(&role)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The full reloadable definition set, as read from the domains TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub domains: Vec<DomainDef>,
    #[serde(default)]
    pub agents: Vec<AgentDef>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

impl ConfigFile {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("parsing domains file: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading domains file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}
