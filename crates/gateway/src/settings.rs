//! Process configuration from environment variables.
//!
//! All knobs have defaults suitable for local development; production
//! deployments set `AUTH_MODE=jwt` plus `AUTH_SECRET` and point
//! `DATABASE_PATH`/`PARLEY_DOMAINS_FILE` at real locations.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No verification: every caller is treated as a development admin.
    None,
    /// HS256 JWT verification on REST and at the WebSocket handshake.
    Jwt,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    pub auth_mode: AuthMode,
    pub auth_secret: String,
    /// Bootstrap users, `user:pass:role;...`.
    pub auth_users: String,

    pub database_path: PathBuf,
    pub domains_file: PathBuf,
    pub workspace_root: PathBuf,

    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model_default: String,
    pub llm_idle_timeout: Duration,
    pub llm_max_in_flight: usize,

    pub approval_timeout: Duration,
    pub max_handoffs: u32,
    pub session_outbound_queue: usize,
    pub max_connections_per_identity: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let auth_mode = match env_or("AUTH_MODE", "none").as_str() {
            "jwt" => AuthMode::Jwt,
            "none" => AuthMode::None,
            other => {
                tracing::warn!(auth_mode = other, "unknown AUTH_MODE, defaulting to none");
                AuthMode::None
            }
        };

        Self {
            host: env_or("PARLEY_HOST", "127.0.0.1"),
            port: env_parse("PARLEY_PORT", 8900),
            auth_mode,
            auth_secret: env_or("AUTH_SECRET", ""),
            auth_users: env_or("AUTH_USERS", ""),
            database_path: PathBuf::from(env_or("DATABASE_PATH", "data/parley.db")),
            domains_file: PathBuf::from(env_or("PARLEY_DOMAINS_FILE", "config/domains.toml")),
            workspace_root: PathBuf::from(env_or("PARLEY_WORKSPACE", "workspace")),
            llm_base_url: env_or("LLM_BASE_URL", "http://localhost:11434/v1"),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|v| !v.is_empty()),
            llm_model_default: env_or("LLM_MODEL_DEFAULT", "gpt-4o-mini"),
            llm_idle_timeout: Duration::from_millis(env_parse("LLM_IDLE_TIMEOUT_MS", 30_000)),
            llm_max_in_flight: env_parse("LLM_MAX_IN_FLIGHT", 8),
            approval_timeout: Duration::from_millis(env_parse("APPROVAL_TIMEOUT_MS", 900_000)),
            max_handoffs: env_parse("MAX_HANDOFFS", 5),
            session_outbound_queue: env_parse("SESSION_OUTBOUND_QUEUE", 256),
            max_connections_per_identity: env_parse("PARLEY_MAX_CONNECTIONS_PER_IDENTITY", 5),
        }
    }

    /// Startup sanity checks. Errors abort the boot; warnings are logged by
    /// the caller.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.auth_mode == AuthMode::Jwt && self.auth_secret.is_empty() {
            return Err("AUTH_MODE=jwt requires AUTH_SECRET".into());
        }
        if self.auth_mode == AuthMode::None {
            warnings.push("AUTH_MODE=none — all callers are treated as admin".into());
        }
        if self.session_outbound_queue < 16 {
            warnings.push(format!(
                "SESSION_OUTBOUND_QUEUE={} is very small; chunk drops will be frequent",
                self.session_outbound_queue
            ));
        }
        Ok(warnings)
    }
}
