//! Tool registry — schema-validated, role-gated, timeout-bounded dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use parley_domain::cancel::CancelToken;
use parley_domain::config::{Role, ToolDef};
use parley_domain::message::ToolSchema;

/// Reserved tool id the model uses to switch agents mid-turn. Intercepted
/// by the conversation runner; never registered or dispatched here.
pub const HANDOFF_TOOL_ID: &str = "handoff";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execution failure kinds. These never abort a turn; they are fed back to
/// the model as an error tool result.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool handler timed out")]
    Timeout,

    #[error("tool handler panicked")]
    HandlerPanic,

    #[error("{message}")]
    HandlerError { message: String },

    #[error("tool is not configured")]
    NotConfigured,
}

/// Pre-execution rejection: bad arguments.
#[derive(Debug, thiserror::Error)]
#[error("invalid arguments for tool {tool_id}: {detail}")]
pub struct ValidationFailure {
    pub tool_id: String,
    pub detail: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Passed to every handler invocation. `run_id` keys replay markers so
/// re-invocation after crash recovery is detectable.
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: String,
    pub cancel: CancelToken,
}

/// A tool implementation: a pure function of arguments to a JSON result.
/// Side-effecting handlers must be idempotent for the same
/// `(run_id, arguments)` pair.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, ctx: ToolContext, args: Value) -> Result<Value, ToolError>;
}

/// Stand-in bound when a `handler_ref` resolves to nothing. Keeps the tool
/// visible (and auditable) while failing fast at execution time.
pub struct UnboundHandler;

#[async_trait::async_trait]
impl ToolHandler for UnboundHandler {
    async fn run(&self, _ctx: ToolContext, _args: Value) -> Result<Value, ToolError> {
        Err(ToolError::NotConfigured)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RegisteredTool {
    def: ToolDef,
    schema: jsonschema::Validator,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Compile the tool's schema and bind its handler. Unless the schema
    /// says otherwise, unknown properties are rejected.
    pub fn register(
        &mut self,
        def: ToolDef,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), String> {
        let mut schema_value = def.parameters_schema.clone();
        if let Some(obj) = schema_value.as_object_mut() {
            if obj.get("type").and_then(Value::as_str) == Some("object")
                && !obj.contains_key("additionalProperties")
            {
                obj.insert("additionalProperties".into(), Value::Bool(false));
            }
        }

        let schema = jsonschema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .build(&schema_value)
            .map_err(|e| format!("tool {:?} schema: {e}", def.id))?;

        self.tools.insert(
            def.id.clone(),
            RegisteredTool {
                def,
                schema,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolDef> {
        self.tools.get(tool_id).map(|t| &t.def)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate arguments against the tool's schema. Returns the arguments
    /// unchanged on success so callers can pass them straight to execute.
    pub fn validate(&self, tool_id: &str, args: &Value) -> Result<Value, ValidationFailure> {
        let tool = self.tools.get(tool_id).ok_or_else(|| ValidationFailure {
            tool_id: tool_id.to_owned(),
            detail: "unknown tool".into(),
        })?;

        if let Err(error) = tool.schema.validate(args) {
            return Err(ValidationFailure {
                tool_id: tool_id.to_owned(),
                detail: error.to_string(),
            });
        }
        Ok(args.clone())
    }

    /// Role gate. Unknown tools fail closed.
    pub fn is_role_allowed(&self, tool_id: &str, role: Role) -> bool {
        self.tools
            .get(tool_id)
            .is_some_and(|t| t.def.role_allowed(role))
    }

    /// Run the handler under the tool's `timeout_ms`. Panics inside the
    /// handler surface as `HandlerPanic`, not a crashed runner task.
    pub async fn execute(
        &self,
        tool_id: &str,
        run_id: &str,
        args: Value,
        cancel: CancelToken,
    ) -> Result<Value, ToolError> {
        let tool = self.tools.get(tool_id).ok_or(ToolError::NotConfigured)?;
        let handler = tool.handler.clone();
        let timeout = Duration::from_millis(tool.def.timeout_ms);
        let ctx = ToolContext {
            run_id: run_id.to_owned(),
            cancel,
        };

        let handle = tokio::spawn(async move { handler.run(ctx, args).await });

        match tokio::time::timeout(timeout, handle).await {
            Err(_elapsed) => {
                tracing::warn!(tool_id, run_id, timeout_ms = tool.def.timeout_ms, "tool timed out");
                Err(ToolError::Timeout)
            }
            Ok(Err(join_err)) => {
                tracing::error!(tool_id, run_id, error = %join_err, "tool handler panicked");
                Err(ToolError::HandlerPanic)
            }
            Ok(Ok(result)) => result,
        }
    }

    /// Schemas exposed to the LLM for a given tool id set. Ids with no
    /// registration are skipped.
    pub fn llm_schemas(&self, tool_ids: &[String]) -> Vec<ToolSchema> {
        tool_ids
            .iter()
            .filter_map(|id| self.tools.get(id))
            .map(|t| ToolSchema {
                name: t.def.id.clone(),
                description: t.def.description.clone(),
                parameters: t.def.parameters_schema.clone(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn run(&self, _ctx: ToolContext, args: Value) -> Result<Value, ToolError> {
            Ok(serde_json::json!({ "echo": args }))
        }
    }

    struct SleepyHandler;

    #[async_trait::async_trait]
    impl ToolHandler for SleepyHandler {
        async fn run(&self, _ctx: ToolContext, _args: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    struct PanickyHandler;

    #[async_trait::async_trait]
    impl ToolHandler for PanickyHandler {
        async fn run(&self, _ctx: ToolContext, _args: Value) -> Result<Value, ToolError> {
            panic!("boom");
        }
    }

    fn tool_def(id: &str, timeout_ms: u64) -> ToolDef {
        ToolDef {
            id: id.into(),
            name: id.into(),
            description: "test tool".into(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
            returns_schema: None,
            handler_ref: id.into(),
            requires_approval: false,
            allowed_roles: vec![Role::Admin, Role::Developer],
            timeout_ms,
            max_retries: 0,
        }
    }

    fn registry_with(id: &str, handler: Arc<dyn ToolHandler>, timeout_ms: u64) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(tool_def(id, timeout_ms), handler).unwrap();
        reg
    }

    #[test]
    fn validate_accepts_matching_args() {
        let reg = registry_with("echo", Arc::new(EchoHandler), 1000);
        let args = serde_json::json!({"path": "a.txt"});
        assert_eq!(reg.validate("echo", &args).unwrap(), args);
    }

    #[test]
    fn validate_rejects_missing_required() {
        let reg = registry_with("echo", Arc::new(EchoHandler), 1000);
        let err = reg.validate("echo", &serde_json::json!({})).unwrap_err();
        assert!(err.detail.contains("path"), "{}", err.detail);
    }

    #[test]
    fn validate_rejects_unknown_properties() {
        let reg = registry_with("echo", Arc::new(EchoHandler), 1000);
        let err = reg
            .validate("echo", &serde_json::json!({"path": "a", "sneaky": 1}))
            .unwrap_err();
        assert!(err.detail.contains("sneaky") || err.detail.contains("additional"));
    }

    #[test]
    fn schema_may_allow_unknown_properties_explicitly() {
        let mut reg = ToolRegistry::new();
        let mut def = tool_def("open", 1000);
        def.parameters_schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "additionalProperties": true
        });
        reg.register(def, Arc::new(EchoHandler)).unwrap();
        assert!(reg
            .validate("open", &serde_json::json!({"path": "a", "extra": 1}))
            .is_ok());
    }

    #[test]
    fn role_gate() {
        let reg = registry_with("echo", Arc::new(EchoHandler), 1000);
        assert!(reg.is_role_allowed("echo", Role::Admin));
        assert!(!reg.is_role_allowed("echo", Role::Guest));
        assert!(!reg.is_role_allowed("ghost", Role::Admin));
    }

    #[test]
    fn empty_allowed_roles_means_open() {
        let mut reg = ToolRegistry::new();
        let mut def = tool_def("open", 1000);
        def.allowed_roles = Vec::new();
        reg.register(def, Arc::new(EchoHandler)).unwrap();
        assert!(reg.is_role_allowed("open", Role::Guest));
    }

    #[tokio::test]
    async fn execute_happy_path() {
        let reg = registry_with("echo", Arc::new(EchoHandler), 1000);
        let result = reg
            .execute(
                "echo",
                "run-1",
                serde_json::json!({"path": "a"}),
                CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result["echo"]["path"], "a");
    }

    #[tokio::test]
    async fn execute_enforces_timeout() {
        let reg = registry_with("slow", Arc::new(SleepyHandler), 50);
        let err = reg
            .execute("slow", "run-1", serde_json::json!({}), CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout));
    }

    #[tokio::test]
    async fn panics_surface_as_handler_panic() {
        let reg = registry_with("boom", Arc::new(PanickyHandler), 1000);
        let err = reg
            .execute("boom", "run-1", serde_json::json!({}), CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::HandlerPanic));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_configured() {
        let reg = ToolRegistry::new();
        let err = reg
            .execute("ghost", "run-1", serde_json::json!({}), CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotConfigured));
    }

    #[tokio::test]
    async fn unbound_handler_fails_as_not_configured() {
        let reg = registry_with("stub", Arc::new(UnboundHandler), 1000);
        let err = reg
            .execute("stub", "r", serde_json::json!({}), CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotConfigured));
    }

    #[test]
    fn llm_schemas_skip_unknown_ids() {
        let reg = registry_with("echo", Arc::new(EchoHandler), 1000);
        let schemas = reg.llm_schemas(&["echo".into(), "ghost".into()]);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo");
    }
}
