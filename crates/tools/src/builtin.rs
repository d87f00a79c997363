//! Builtin tool handlers — workspace-confined file I/O.
//!
//! Handlers are bound by `handler_ref` in the tool definition via
//! [`resolve_handler`]. Side-effecting handlers keep an on-disk replay
//! marker keyed by the tool-run id: re-invoking with the same
//! `(run_id, arguments)` is detected and short-circuits instead of
//! repeating the effect.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::registry::{ToolContext, ToolError, ToolHandler, UnboundHandler};

/// Directory (under the workspace root) holding replay markers.
const MARKER_DIR: &str = ".tool-runs";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a `handler_ref` to its implementation. Unknown refs bind to
/// [`UnboundHandler`], which fails at execution time with `NotConfigured`
/// so the tool stays visible and auditable.
pub fn resolve_handler(handler_ref: &str, workspace_root: &Path) -> Arc<dyn ToolHandler> {
    match handler_ref {
        "file_write" => Arc::new(FileWriteHandler {
            workspace_root: workspace_root.to_path_buf(),
        }),
        "file_read" => Arc::new(FileReadHandler {
            workspace_root: workspace_root.to_path_buf(),
        }),
        other => {
            tracing::warn!(handler_ref = other, "no handler bound for ref");
            Arc::new(UnboundHandler)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path confinement
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a requested path inside the workspace root. Absolute paths and
/// any `..` component are rejected before touching the filesystem.
fn confine(workspace_root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(ToolError::HandlerError {
            message: format!("absolute paths are not allowed: {requested}"),
        });
    }
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(ToolError::HandlerError {
                message: format!("path escapes the workspace: {requested}"),
            });
        }
    }
    Ok(workspace_root.join(requested_path))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replay markers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn args_digest(args: &Value) -> String {
    hex::encode(Sha256::digest(args.to_string().as_bytes()))
}

fn marker_path(workspace_root: &Path, run_id: &str) -> PathBuf {
    workspace_root.join(MARKER_DIR).join(run_id)
}

/// Check for an existing marker for `(run_id, args)`. Returns true when
/// this exact invocation already ran to completion.
async fn replay_detected(
    workspace_root: &Path,
    run_id: &str,
    args: &Value,
) -> Result<bool, ToolError> {
    let path = marker_path(workspace_root, run_id);
    match tokio::fs::read_to_string(&path).await {
        Ok(stored) => Ok(stored.trim() == args_digest(args)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ToolError::HandlerError {
            message: format!("reading replay marker: {e}"),
        }),
    }
}

async fn write_marker(
    workspace_root: &Path,
    run_id: &str,
    args: &Value,
) -> Result<(), ToolError> {
    let dir = workspace_root.join(MARKER_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ToolError::HandlerError {
            message: format!("creating marker dir: {e}"),
        })?;
    tokio::fs::write(marker_path(workspace_root, run_id), args_digest(args))
        .await
        .map_err(|e| ToolError::HandlerError {
            message: format!("writing replay marker: {e}"),
        })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// file_write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct FileWriteArgs {
    path: String,
    content: String,
}

pub struct FileWriteHandler {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl ToolHandler for FileWriteHandler {
    async fn run(&self, ctx: ToolContext, args: Value) -> Result<Value, ToolError> {
        let parsed: FileWriteArgs =
            serde_json::from_value(args.clone()).map_err(|e| ToolError::HandlerError {
                message: format!("bad arguments: {e}"),
            })?;

        if replay_detected(&self.workspace_root, &ctx.run_id, &args).await? {
            tracing::info!(run_id = %ctx.run_id, path = %parsed.path, "file_write replay detected");
            return Ok(serde_json::json!({
                "path": parsed.path,
                "bytes": parsed.content.len(),
                "replayed": true,
            }));
        }

        let target = confine(&self.workspace_root, &parsed.path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::HandlerError {
                    message: format!("creating {}: {e}", parent.display()),
                })?;
        }
        tokio::fs::write(&target, parsed.content.as_bytes())
            .await
            .map_err(|e| ToolError::HandlerError {
                message: format!("writing {}: {e}", target.display()),
            })?;

        write_marker(&self.workspace_root, &ctx.run_id, &args).await?;

        Ok(serde_json::json!({
            "path": parsed.path,
            "bytes": parsed.content.len(),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// file_read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct FileReadArgs {
    path: String,
    #[serde(default)]
    max_bytes: Option<usize>,
}

pub struct FileReadHandler {
    pub workspace_root: PathBuf,
}

#[async_trait::async_trait]
impl ToolHandler for FileReadHandler {
    async fn run(&self, _ctx: ToolContext, args: Value) -> Result<Value, ToolError> {
        let parsed: FileReadArgs =
            serde_json::from_value(args).map_err(|e| ToolError::HandlerError {
                message: format!("bad arguments: {e}"),
            })?;

        let target = confine(&self.workspace_root, &parsed.path)?;
        let mut content =
            tokio::fs::read_to_string(&target)
                .await
                .map_err(|e| ToolError::HandlerError {
                    message: format!("reading {}: {e}", parsed.path),
                })?;

        let mut truncated = false;
        if let Some(max) = parsed.max_bytes {
            if content.len() > max {
                let mut end = max;
                while !content.is_char_boundary(end) && end > 0 {
                    end -= 1;
                }
                content.truncate(end);
                truncated = true;
            }
        }

        Ok(serde_json::json!({
            "path": parsed.path,
            "content": content,
            "truncated": truncated,
        }))
    }
}
