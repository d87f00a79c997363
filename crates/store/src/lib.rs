//! Durable conversation store over SQLite.
//!
//! Persists conversations, messages, tool runs, and the workflow audit log.
//! All multi-statement operations run inside a transaction. Invariants
//! enforced here:
//!
//! 1. message `seq` is strictly increasing per conversation (assigned
//!    in-transaction);
//! 2. tool-run status only moves along the allowed DAG, via compare-and-set;
//! 3. a conversation's `updated_at` tracks its latest message.

mod audit;
mod conversations;
mod error;
mod messages;
mod schema;
mod tool_runs;

pub use error::{StoreError, StoreResult};
pub use tool_runs::{ToolRunFilter, TransitionPatch};

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

/// The conversation store. One process-wide instance; the connection is
/// serialized behind a mutex (SQLite statements here are short-lived).
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open (creating if needed) the store at `path` and apply migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Open(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::info!(path = %path.display(), "conversation store ready");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Open(format!(":memory:: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        schema::apply_migrations(&mut conn)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}
