use parley_domain::records::ToolRunStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("opening database: {0}")]
    Open(String),

    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition for run {run_id}: {found:?} (expected {expected:?}) -> {to:?}")]
    IllegalTransition {
        run_id: String,
        expected: ToolRunStatus,
        found: ToolRunStatus,
        to: ToolRunStatus,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
