//! Tool-run rows. Status moves only along the allowed DAG, via
//! compare-and-set inside a transaction that also writes the audit row.

use rusqlite::{params, Row, Transaction};

use parley_domain::ids;
use parley_domain::records::{ToolRun, ToolRunStatus};

use crate::conversations::parse_ts;
use crate::{ConversationStore, StoreError, StoreResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Patch & filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fields updated alongside a status transition. `actor` and `reason` feed
/// the audit row.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub approved_by_sub: Option<String>,
    pub rejection_reason: Option<String>,
    pub actor: String,
    pub reason: Option<String>,
}

impl TransitionPatch {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRunFilter {
    pub conversation_id: Option<String>,
    pub status: Option<ToolRunStatus>,
    pub limit: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RawRun {
    run: ToolRun,
    parameters: String,
    status: String,
    result: Option<String>,
    requested_at: String,
    decided_at: Option<String>,
    executed_at: Option<String>,
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run: ToolRun {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            turn_id: row.get(2)?,
            tool_id: row.get(3)?,
            requested_by_agent_id: row.get(4)?,
            parameters: serde_json::Value::Null,
            status: ToolRunStatus::Pending,
            result: None,
            error: row.get(8)?,
            approved_by_sub: row.get(9)?,
            rejection_reason: row.get(10)?,
            requested_at: chrono::Utc::now(),
            decided_at: None,
            executed_at: None,
        },
        parameters: row.get(5)?,
        status: row.get(6)?,
        result: row.get(7)?,
        requested_at: row.get(11)?,
        decided_at: row.get(12)?,
        executed_at: row.get(13)?,
    })
}

fn finish_row(raw: RawRun) -> StoreResult<ToolRun> {
    let mut run = raw.run;
    run.parameters = serde_json::from_str(&raw.parameters)?;
    run.status = raw
        .status
        .parse()
        .map_err(StoreError::Corrupt)?;
    run.result = raw.result.map(|r| serde_json::from_str(&r)).transpose()?;
    run.requested_at = parse_ts(&raw.requested_at)?;
    run.decided_at = raw.decided_at.as_deref().map(parse_ts).transpose()?;
    run.executed_at = raw.executed_at.as_deref().map(parse_ts).transpose()?;
    Ok(run)
}

const SELECT_COLS: &str = "id, conversation_id, turn_id, tool_id, requested_by_agent_id, \
     parameters, status, result, error, approved_by_sub, rejection_reason, \
     requested_at, decided_at, executed_at";

fn insert_audit_row(
    tx: &Transaction<'_>,
    run_id: &str,
    from: Option<ToolRunStatus>,
    to: ToolRunStatus,
    actor: &str,
    reason: Option<&str>,
) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO workflow_logs (run_id, from_status, to_status, actor, reason, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            from.map(|s| s.as_str()),
            to.as_str(),
            actor,
            reason,
            ids::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl ConversationStore {
    /// Persist a new tool run. The initial status must be PENDING; the
    /// creation itself is audited.
    pub fn create_tool_run(
        &self,
        conversation_id: &str,
        turn_id: &str,
        tool_id: &str,
        requested_by_agent_id: Option<&str>,
        parameters: serde_json::Value,
    ) -> StoreResult<ToolRun> {
        let run = ToolRun {
            id: ids::new_id(),
            conversation_id: conversation_id.to_owned(),
            turn_id: turn_id.to_owned(),
            tool_id: tool_id.to_owned(),
            requested_by_agent_id: requested_by_agent_id.map(str::to_owned),
            parameters,
            status: ToolRunStatus::Pending,
            result: None,
            error: None,
            approved_by_sub: None,
            rejection_reason: None,
            requested_at: ids::now(),
            decided_at: None,
            executed_at: None,
        };
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO tool_runs \
                 (id, conversation_id, turn_id, tool_id, requested_by_agent_id, parameters, \
                  status, requested_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.id,
                    run.conversation_id,
                    run.turn_id,
                    run.tool_id,
                    run.requested_by_agent_id,
                    serde_json::to_string(&run.parameters)?,
                    run.status.as_str(),
                    run.requested_at.to_rfc3339(),
                ],
            )?;
            insert_audit_row(
                &tx,
                &run.id,
                None,
                ToolRunStatus::Pending,
                run.requested_by_agent_id.as_deref().unwrap_or("system"),
                None,
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(run)
    }

    /// Compare-and-set status transition. Fails with `IllegalTransition`
    /// when the current status is not `from` or the edge is not in the DAG.
    /// Writes the audit row in the same transaction and returns the updated
    /// run.
    pub fn transition_tool_run(
        &self,
        run_id: &str,
        from: ToolRunStatus,
        to: ToolRunStatus,
        patch: TransitionPatch,
    ) -> StoreResult<ToolRun> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let current_raw: String = tx
                .query_row(
                    "SELECT status FROM tool_runs WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("tool run {run_id}"))
                    }
                    other => StoreError::Sqlite(other),
                })?;
            let current: ToolRunStatus = current_raw.parse().map_err(StoreError::Corrupt)?;

            if current != from || !from.can_transition_to(to) {
                return Err(StoreError::IllegalTransition {
                    run_id: run_id.to_owned(),
                    expected: from,
                    found: current,
                    to,
                });
            }

            let now = ids::now().to_rfc3339();
            let decided_at = matches!(to, ToolRunStatus::Approved | ToolRunStatus::Rejected)
                .then(|| now.clone());
            let executed_at = matches!(to, ToolRunStatus::Executed | ToolRunStatus::Failed)
                .then(|| now.clone());
            let result_raw = patch
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            tx.execute(
                "UPDATE tool_runs SET \
                   status = ?2, \
                   result = COALESCE(?3, result), \
                   error = COALESCE(?4, error), \
                   approved_by_sub = COALESCE(?5, approved_by_sub), \
                   rejection_reason = COALESCE(?6, rejection_reason), \
                   decided_at = COALESCE(?7, decided_at), \
                   executed_at = COALESCE(?8, executed_at) \
                 WHERE id = ?1",
                params![
                    run_id,
                    to.as_str(),
                    result_raw,
                    patch.error,
                    patch.approved_by_sub,
                    patch.rejection_reason,
                    decided_at,
                    executed_at,
                ],
            )?;
            insert_audit_row(&tx, run_id, Some(from), to, &patch.actor, patch.reason.as_deref())?;

            let updated = finish_row(tx.query_row(
                &format!("SELECT {SELECT_COLS} FROM tool_runs WHERE id = ?1"),
                params![run_id],
                row_to_run,
            )?)?;
            tx.commit()?;

            tracing::debug!(
                run_id,
                from = from.as_str(),
                to = to.as_str(),
                actor = %patch.actor,
                "tool run transition"
            );
            Ok(updated)
        })
    }

    pub fn get_tool_run(&self, run_id: &str) -> StoreResult<ToolRun> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLS} FROM tool_runs WHERE id = ?1"),
                    params![run_id],
                    row_to_run,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("tool run {run_id}"))
                    }
                    other => StoreError::Sqlite(other),
                })?;
            finish_row(raw)
        })
    }

    /// List tool runs, newest first, with optional conversation/status
    /// filters.
    pub fn list_tool_runs(&self, filter: &ToolRunFilter) -> StoreResult<Vec<ToolRun>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {SELECT_COLS} FROM tool_runs WHERE 1=1");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(conv) = &filter.conversation_id {
                sql.push_str(" AND conversation_id = ?");
                args.push(Box::new(conv.clone()));
            }
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                args.push(Box::new(status.as_str()));
            }
            sql.push_str(" ORDER BY requested_at DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                args.iter().map(|a| a.as_ref()).collect();
            let rows: Vec<_> = stmt
                .query_map(params_ref.as_slice(), row_to_run)?
                .collect::<rusqlite::Result<_>>()?;
            rows.into_iter().map(finish_row).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_run() -> (ConversationStore, ToolRun) {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store.create_conversation("d1", "alice", None).unwrap();
        let run = store
            .create_tool_run(
                &conv.id,
                "turn-1",
                "file_write",
                Some("a1"),
                serde_json::json!({"path": "out.txt", "content": "ok"}),
            )
            .unwrap();
        (store, run)
    }

    #[test]
    fn new_runs_start_pending() {
        let (_store, run) = store_with_run();
        assert_eq!(run.status, ToolRunStatus::Pending);
        assert!(run.decided_at.is_none());
    }

    #[test]
    fn happy_path_transitions() {
        let (store, run) = store_with_run();

        let approved = store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Pending,
                ToolRunStatus::Approved,
                TransitionPatch {
                    approved_by_sub: Some("admin".into()),
                    ..TransitionPatch::by("admin")
                },
            )
            .unwrap();
        assert_eq!(approved.status, ToolRunStatus::Approved);
        assert!(approved.decided_at.is_some());
        assert_eq!(approved.approved_by_sub.as_deref(), Some("admin"));

        store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Approved,
                ToolRunStatus::Executing,
                TransitionPatch::by("runner"),
            )
            .unwrap();

        let executed = store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Executing,
                ToolRunStatus::Executed,
                TransitionPatch {
                    result: Some(serde_json::json!({"bytes": 2})),
                    ..TransitionPatch::by("runner")
                },
            )
            .unwrap();
        assert_eq!(executed.status, ToolRunStatus::Executed);
        assert!(executed.executed_at.is_some());
        assert_eq!(executed.result.unwrap()["bytes"], 2);
    }

    #[test]
    fn cas_rejects_stale_from() {
        let (store, run) = store_with_run();
        store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Pending,
                ToolRunStatus::Rejected,
                TransitionPatch::by("admin").with_reason("no"),
            )
            .unwrap();

        // A second decision races in and must lose.
        let err = store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Pending,
                ToolRunStatus::Approved,
                TransitionPatch::by("other"),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { found, .. }
            if found == ToolRunStatus::Rejected));
    }

    #[test]
    fn dag_edges_enforced() {
        let (store, run) = store_with_run();
        // PENDING -> EXECUTED is not a DAG edge even with a matching CAS.
        assert!(store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Pending,
                ToolRunStatus::Executed,
                TransitionPatch::by("runner"),
            )
            .is_err());
    }

    #[test]
    fn transitions_write_audit_rows() {
        let (store, run) = store_with_run();
        store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Pending,
                ToolRunStatus::Rejected,
                TransitionPatch::by("admin").with_reason("timeout"),
            )
            .unwrap();

        let logs = store.list_workflow_logs(&run.id).unwrap();
        assert_eq!(logs.len(), 2); // creation + rejection
        assert_eq!(logs[0].to_status, ToolRunStatus::Pending);
        assert_eq!(logs[1].to_status, ToolRunStatus::Rejected);
        assert_eq!(logs[1].actor, "admin");
        assert_eq!(logs[1].reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn filters_by_status_and_conversation() {
        let (store, run) = store_with_run();
        let other_conv = store.create_conversation("d1", "bob", None).unwrap();
        store
            .create_tool_run(&other_conv.id, "turn-2", "file_read", None, serde_json::json!({}))
            .unwrap();

        let pending = store
            .list_tool_runs(&ToolRunFilter {
                status: Some(ToolRunStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 2);

        let scoped = store
            .list_tool_runs(&ToolRunFilter {
                conversation_id: Some(run.conversation_id.clone()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, run.id);
    }

    #[test]
    fn unknown_run_is_not_found() {
        let store = ConversationStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_tool_run("nope"),
            Err(StoreError::NotFound(_))
        ));
    }
}
