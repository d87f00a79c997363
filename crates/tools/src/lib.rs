//! Tool registry, parameter validation, and builtin handlers.
//!
//! Tools are declared in configuration ([`parley_domain::config::ToolDef`])
//! and bound to handler implementations by `handler_ref`. The registry
//! validates arguments against the tool's JSON Schema (draft-07), gates on
//! caller role, and dispatches with a hard timeout.

pub mod builtin;
pub mod registry;

pub use registry::{
    ToolContext, ToolError, ToolHandler, ToolRegistry, ValidationFailure, HANDOFF_TOOL_ID,
};
