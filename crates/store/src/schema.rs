//! Schema migrations, versioned via SQLite's `user_version` pragma.
//! Each entry runs once, in order, inside its own transaction.

use rusqlite::Connection;

use crate::{StoreError, StoreResult};

const MIGRATIONS: &[&str] = &[
    // v1 — initial schema.
    r#"
    CREATE TABLE conversations (
        id              TEXT PRIMARY KEY,
        domain_id       TEXT NOT NULL,
        initial_agent_id TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL,
        title           TEXT,
        creator_sub     TEXT NOT NULL,
        status          TEXT NOT NULL DEFAULT 'open'
    );

    CREATE TABLE messages (
        id              TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        seq             INTEGER NOT NULL,
        role            TEXT NOT NULL,
        content         TEXT NOT NULL,
        agent_id        TEXT,
        created_at      TEXT NOT NULL,
        metadata        TEXT,
        UNIQUE (conversation_id, seq)
    );

    CREATE TABLE tool_runs (
        id                    TEXT PRIMARY KEY,
        conversation_id       TEXT NOT NULL REFERENCES conversations(id),
        turn_id               TEXT NOT NULL,
        tool_id               TEXT NOT NULL,
        requested_by_agent_id TEXT,
        parameters            TEXT NOT NULL,
        status                TEXT NOT NULL,
        result                TEXT,
        error                 TEXT,
        approved_by_sub       TEXT,
        rejection_reason      TEXT,
        requested_at          TEXT NOT NULL,
        decided_at            TEXT,
        executed_at           TEXT
    );
    CREATE INDEX idx_tool_runs_status ON tool_runs(status);
    CREATE INDEX idx_tool_runs_conversation ON tool_runs(conversation_id);

    CREATE TABLE workflow_logs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id      TEXT NOT NULL,
        from_status TEXT,
        to_status   TEXT NOT NULL,
        actor       TEXT NOT NULL,
        reason      TEXT,
        created_at  TEXT NOT NULL
    );
    CREATE INDEX idx_workflow_logs_run ON workflow_logs(run_id);
    "#,
];

pub(crate) fn apply_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::debug!(version, "applied store migration");
    }

    let after: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if after < MIGRATIONS.len() as i64 {
        return Err(StoreError::Corrupt(format!(
            "user_version {after} below expected {}",
            MIGRATIONS.len()
        )));
    }
    Ok(())
}
