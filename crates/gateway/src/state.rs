//! Shared application state passed to all handlers.
//!
//! Every subsystem is an explicit `Arc` handle wired at boot — no global
//! singletons. Tests construct their own `AppState` over an in-memory
//! store and a scripted LLM client.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;

use parley_domain::registry::{ConfigRegistry, Snapshot};
use parley_providers::ClientPool;
use parley_store::ConversationStore;
use parley_tools::builtin::resolve_handler;
use parley_tools::ToolRegistry;

use crate::auth::AuthService;
use crate::hub::Hub;
use crate::runtime::approval::ApprovalCoordinator;
use crate::runtime::cancel::CancelMap;
use crate::runtime::turn_lock::TurnLockMap;
use crate::settings::Settings;

/// Compiled tool registry, rebuilt on every config reload. Readers grab
/// the current `Arc` once per turn.
pub struct ToolHost {
    inner: RwLock<Arc<ToolRegistry>>,
    workspace_root: std::path::PathBuf,
}

impl ToolHost {
    pub fn build(snapshot: &Snapshot, workspace_root: &std::path::Path) -> Self {
        let host = Self {
            inner: RwLock::new(Arc::new(ToolRegistry::new())),
            workspace_root: workspace_root.to_path_buf(),
        };
        host.rebuild(snapshot);
        host
    }

    pub fn current(&self) -> Arc<ToolRegistry> {
        self.inner.read().clone()
    }

    /// Compile schemas and bind handlers for every tool in the snapshot.
    /// A tool whose schema fails to compile is skipped (and logged); the
    /// rest of the registry still installs.
    pub fn rebuild(&self, snapshot: &Snapshot) {
        let mut registry = ToolRegistry::new();
        for tool in snapshot.list_tools() {
            let handler = resolve_handler(&tool.handler_ref, &self.workspace_root);
            if let Err(e) = registry.register((*tool).clone(), handler) {
                tracing::error!(tool_id = %tool.id, error = %e, "tool skipped");
            }
        }
        tracing::info!(tools = registry.len(), "tool registry rebuilt");
        *self.inner.write() = Arc::new(registry);
    }
}

/// Shared application state. Fields are grouped by concern:
/// - **Configuration** — settings, config registry, tool host
/// - **Persistence** — conversation store
/// - **Turn execution** — LLM pool, approvals, cancel tokens, turn locks
/// - **Sessions** — the WebSocket hub
/// - **Security & observability** — auth service, Prometheus handle
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConfigRegistry>,
    pub tools: Arc<ToolHost>,

    pub store: Arc<ConversationStore>,

    pub pool: Arc<ClientPool>,
    pub approvals: Arc<ApprovalCoordinator>,
    pub cancel_map: Arc<CancelMap>,
    pub turn_locks: Arc<TurnLockMap>,

    pub hub: Arc<Hub>,

    pub auth: Arc<AuthService>,
    pub prometheus: PrometheusHandle,
}
