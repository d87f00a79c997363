//! Workflow audit log queries. Rows are written by the tool-run
//! transitions; this module only reads them back.

use rusqlite::{params, Row};

use parley_domain::records::{ToolRunStatus, WorkflowLog};

use crate::conversations::parse_ts;
use crate::{ConversationStore, StoreError, StoreResult};

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<(WorkflowLog, Option<String>, String, String)> {
    Ok((
        WorkflowLog {
            id: row.get(0)?,
            run_id: row.get(1)?,
            from_status: None,
            to_status: ToolRunStatus::Pending,
            actor: row.get(4)?,
            reason: row.get(5)?,
            created_at: chrono::Utc::now(),
        },
        row.get::<_, Option<String>>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(6)?,
    ))
}

impl ConversationStore {
    /// Audit trail for one tool run, oldest first.
    pub fn list_workflow_logs(&self, run_id: &str) -> StoreResult<Vec<WorkflowLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, from_status, to_status, actor, reason, created_at \
                 FROM workflow_logs WHERE run_id = ?1 ORDER BY id ASC",
            )?;
            let rows: Vec<_> = stmt
                .query_map(params![run_id], row_to_log)?
                .collect::<rusqlite::Result<_>>()?;
            rows.into_iter()
                .map(|(mut log, from, to, created)| {
                    log.from_status = from
                        .map(|s| s.parse().map_err(StoreError::Corrupt))
                        .transpose()?;
                    log.to_status = to.parse().map_err(StoreError::Corrupt)?;
                    log.created_at = parse_ts(&created)?;
                    Ok(log)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransitionPatch;

    #[test]
    fn audit_sequence_is_a_valid_dag_path() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store.create_conversation("d1", "alice", None).unwrap();
        let run = store
            .create_tool_run(&conv.id, "t1", "file_write", None, serde_json::json!({}))
            .unwrap();

        store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Pending,
                ToolRunStatus::Approved,
                TransitionPatch::by("admin"),
            )
            .unwrap();
        store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Approved,
                ToolRunStatus::Executing,
                TransitionPatch::by("runner"),
            )
            .unwrap();
        store
            .transition_tool_run(
                &run.id,
                ToolRunStatus::Executing,
                ToolRunStatus::Failed,
                TransitionPatch {
                    error: Some("timeout".into()),
                    ..TransitionPatch::by("runner")
                },
            )
            .unwrap();

        let logs = store.list_workflow_logs(&run.id).unwrap();
        assert_eq!(logs.len(), 4);
        // Every recorded edge after creation is valid in the DAG.
        for log in &logs[1..] {
            let from = log.from_status.unwrap();
            assert!(
                from.can_transition_to(log.to_status),
                "{from:?} -> {:?}",
                log.to_status
            );
        }
        // And the chain is connected.
        for window in logs.windows(2) {
            assert_eq!(window[1].from_status, Some(window[0].to_status));
        }
    }

    #[test]
    fn unknown_run_has_empty_trail() {
        let store = ConversationStore::open_in_memory().unwrap();
        assert!(store.list_workflow_logs("ghost").unwrap().is_empty());
    }
}
