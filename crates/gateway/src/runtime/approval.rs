//! Approval coordinator — correlates human decisions with paused tool runs.
//!
//! Each awaiting turn registers a one-shot rendezvous keyed by tool-run id.
//! A decision may arrive over the WebSocket or REST; it first wins the
//! compare-and-set on the stored run status (the arbiter for every race),
//! then completes the waiter. Decisions that land before the runner
//! registers are buffered for a short grace window so the
//! "runner persists PENDING" / "admin clicks approve" race cannot lose
//! the decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use parley_domain::cancel::CancelToken;
use parley_domain::records::{ToolRun, ToolRunStatus};
use parley_store::{ConversationStore, StoreError, TransitionPatch};

use crate::metrics::{TOOL_RUNS_APPROVED_TOTAL, TOOL_RUNS_REJECTED_TOTAL};

/// How long an early decision is buffered waiting for its runner.
const GRACE_WINDOW: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A human (or auto) decision on one pending tool run.
#[derive(Debug, Clone)]
pub enum Decision {
    Approved {
        approver_sub: String,
    },
    Rejected {
        approver_sub: Option<String>,
        reason: String,
    },
}

/// What the runner sees after awaiting a decision.
#[derive(Debug)]
pub enum WaitOutcome {
    Decision(Decision),
    /// No decision within the approval timeout; the run is already
    /// REJECTED(reason="timeout") when this is returned.
    TimedOut,
    /// The turn was cancelled while waiting.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("a waiter is already registered for run {0}")]
    DuplicateWaiter(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("tool run {0} not found")]
    NotFound(String),

    /// The run is not PENDING (already decided, executing, or terminal).
    #[error("tool run {run_id} is {status:?}, not PENDING")]
    IllegalDecision {
        run_id: String,
        status: ToolRunStatus,
    },

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ApprovalCoordinator {
    store: Arc<ConversationStore>,
    timeout: Duration,
    waiters: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
    /// run_id → (decision, expiry). Consumed by the next `register`.
    early: Mutex<HashMap<String, (Decision, Instant)>>,
}

impl ApprovalCoordinator {
    pub fn new(store: Arc<ConversationStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            waiters: Mutex::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the rendezvous for a pending run. At most one waiter per
    /// run id. If a decision already arrived within the grace window it is
    /// delivered immediately.
    pub fn register(&self, run_id: &str) -> Result<oneshot::Receiver<Decision>, RegisterError> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(run_id) {
            return Err(RegisterError::DuplicateWaiter(run_id.to_owned()));
        }

        let (tx, rx) = oneshot::channel();

        let buffered = {
            let mut early = self.early.lock();
            match early.remove(run_id) {
                Some((decision, expires_at)) if expires_at > Instant::now() => Some(decision),
                _ => None,
            }
        };

        if let Some(decision) = buffered {
            let _ = tx.send(decision);
        } else {
            waiters.insert(run_id.to_owned(), tx);
        }
        Ok(rx)
    }

    /// Drop a waiter without resolving it (turn ends for another reason).
    pub fn unregister(&self, run_id: &str) {
        self.waiters.lock().remove(run_id);
    }

    /// Suspend until a decision, the approval timeout, or cancellation.
    ///
    /// On timeout the run is CAS-transitioned PENDING→REJECTED with reason
    /// `"timeout"` exactly once; if a decision wins that race instead, the
    /// decision is returned.
    pub async fn await_decision(
        &self,
        run_id: &str,
        mut rx: oneshot::Receiver<Decision>,
        cancel: &CancelToken,
    ) -> WaitOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.unregister(run_id);
                WaitOutcome::Cancelled
            }
            received = &mut rx => match received {
                Ok(decision) => WaitOutcome::Decision(decision),
                // Sender dropped without a decision (should not happen) —
                // treat like a timeout so the turn cannot hang.
                Err(_) => self.reject_for_timeout(run_id, rx).await,
            },
            _ = tokio::time::sleep(self.timeout) => {
                self.unregister(run_id);
                self.reject_for_timeout(run_id, rx).await
            }
        }
    }

    /// The timeout path. The store CAS arbitrates the race against a
    /// concurrent decision: whichever transition commits first wins.
    async fn reject_for_timeout(
        &self,
        run_id: &str,
        mut rx: oneshot::Receiver<Decision>,
    ) -> WaitOutcome {
        match self.store.transition_tool_run(
            run_id,
            ToolRunStatus::Pending,
            ToolRunStatus::Rejected,
            TransitionPatch {
                rejection_reason: Some("timeout".into()),
                ..TransitionPatch::by("system").with_reason("timeout")
            },
        ) {
            Ok(_) => {
                counter!(TOOL_RUNS_REJECTED_TOTAL).increment(1);
                tracing::info!(run_id, "approval timed out, run rejected");
                WaitOutcome::TimedOut
            }
            Err(StoreError::IllegalTransition { .. }) => {
                // A decision beat the timeout to the store. It is either in
                // the channel already or arriving momentarily.
                match rx.try_recv() {
                    Ok(decision) => WaitOutcome::Decision(decision),
                    Err(_) => self.synthesize_from_store(run_id),
                }
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "timeout transition failed");
                WaitOutcome::TimedOut
            }
        }
    }

    /// Rebuild the decision from the persisted run when the channel lost
    /// the race delivery.
    fn synthesize_from_store(&self, run_id: &str) -> WaitOutcome {
        match self.store.get_tool_run(run_id) {
            Ok(run) => match run.status {
                ToolRunStatus::Approved => WaitOutcome::Decision(Decision::Approved {
                    approver_sub: run.approved_by_sub.unwrap_or_else(|| "unknown".into()),
                }),
                _ => WaitOutcome::Decision(Decision::Rejected {
                    approver_sub: run.approved_by_sub,
                    reason: run.rejection_reason.unwrap_or_else(|| "rejected".into()),
                }),
            },
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    /// Record a decision. Transitions the stored run first (rejecting
    /// decisions for unknown or non-PENDING runs), then completes the
    /// waiter — or buffers the decision when no waiter exists yet.
    pub fn submit_decision(
        &self,
        run_id: &str,
        approved: bool,
        reason: Option<String>,
        approver_sub: &str,
    ) -> Result<ToolRun, SubmitError> {
        let run = match self.store.get_tool_run(run_id) {
            Ok(run) => run,
            Err(StoreError::NotFound(_)) => return Err(SubmitError::NotFound(run_id.to_owned())),
            Err(e) => return Err(e.into()),
        };
        if run.status != ToolRunStatus::Pending {
            return Err(SubmitError::IllegalDecision {
                run_id: run_id.to_owned(),
                status: run.status,
            });
        }

        let (to, decision, patch) = if approved {
            (
                ToolRunStatus::Approved,
                Decision::Approved {
                    approver_sub: approver_sub.to_owned(),
                },
                TransitionPatch {
                    approved_by_sub: Some(approver_sub.to_owned()),
                    ..TransitionPatch::by(approver_sub)
                },
            )
        } else {
            let reason = reason.unwrap_or_else(|| "rejected".into());
            (
                ToolRunStatus::Rejected,
                Decision::Rejected {
                    approver_sub: Some(approver_sub.to_owned()),
                    reason: reason.clone(),
                },
                TransitionPatch {
                    rejection_reason: Some(reason.clone()),
                    ..TransitionPatch::by(approver_sub).with_reason(reason)
                },
            )
        };

        let updated = match self
            .store
            .transition_tool_run(run_id, ToolRunStatus::Pending, to, patch)
        {
            Ok(updated) => updated,
            Err(StoreError::IllegalTransition { found, .. }) => {
                // Lost a race with the timeout sweeper or another approver.
                return Err(SubmitError::IllegalDecision {
                    run_id: run_id.to_owned(),
                    status: found,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if approved {
            counter!(TOOL_RUNS_APPROVED_TOTAL).increment(1);
        } else {
            counter!(TOOL_RUNS_REJECTED_TOTAL).increment(1);
        }

        let waiter = self.waiters.lock().remove(run_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(decision);
            }
            None => {
                self.early
                    .lock()
                    .insert(run_id.to_owned(), (decision, Instant::now() + GRACE_WINDOW));
            }
        }
        Ok(updated)
    }

    /// Drop grace-window entries past their expiry. Called from a
    /// background sweeper.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.early.lock().retain(|_, (_, expires)| *expires > now);
    }

    /// Number of waiters currently suspended (monitoring).
    pub fn pending_waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator_with_run(timeout: Duration) -> (Arc<ConversationStore>, ApprovalCoordinator, String) {
        let store = Arc::new(ConversationStore::open_in_memory().unwrap());
        let conv = store.create_conversation("d1", "alice", None).unwrap();
        let run = store
            .create_tool_run(&conv.id, "turn-1", "file_write", None, serde_json::json!({}))
            .unwrap();
        let coordinator = ApprovalCoordinator::new(store.clone(), timeout);
        (store, coordinator, run.id)
    }

    #[tokio::test]
    async fn decision_resolves_waiter_and_store() {
        let (store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));
        let rx = coordinator.register(&run_id).unwrap();

        coordinator
            .submit_decision(&run_id, true, None, "admin")
            .unwrap();

        let outcome = coordinator
            .await_decision(&run_id, rx, &CancelToken::new())
            .await;
        assert!(matches!(
            outcome,
            WaitOutcome::Decision(Decision::Approved { ref approver_sub }) if approver_sub == "admin"
        ));
        assert_eq!(
            store.get_tool_run(&run_id).unwrap().status,
            ToolRunStatus::Approved
        );
    }

    #[tokio::test]
    async fn rejection_carries_reason() {
        let (store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));
        let rx = coordinator.register(&run_id).unwrap();
        coordinator
            .submit_decision(&run_id, false, Some("no".into()), "admin")
            .unwrap();

        match coordinator.await_decision(&run_id, rx, &CancelToken::new()).await {
            WaitOutcome::Decision(Decision::Rejected { reason, .. }) => assert_eq!(reason, "no"),
            other => panic!("expected rejection, got {other:?}"),
        }
        let run = store.get_tool_run(&run_id).unwrap();
        assert_eq!(run.status, ToolRunStatus::Rejected);
        assert_eq!(run.rejection_reason.as_deref(), Some("no"));
    }

    #[tokio::test]
    async fn duplicate_waiter_rejected() {
        let (_store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));
        let _rx = coordinator.register(&run_id).unwrap();
        assert!(matches!(
            coordinator.register(&run_id),
            Err(RegisterError::DuplicateWaiter(_))
        ));
    }

    #[tokio::test]
    async fn early_decision_buffered_for_late_register() {
        let (_store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));

        // Admin decides before the runner registers.
        coordinator
            .submit_decision(&run_id, true, None, "admin")
            .unwrap();

        let rx = coordinator.register(&run_id).unwrap();
        let outcome = coordinator
            .await_decision(&run_id, rx, &CancelToken::new())
            .await;
        assert!(matches!(outcome, WaitOutcome::Decision(Decision::Approved { .. })));
    }

    #[tokio::test]
    async fn decision_for_unknown_run_is_not_found() {
        let (_store, coordinator, _run_id) = coordinator_with_run(Duration::from_secs(60));
        assert!(matches!(
            coordinator.submit_decision("ghost", true, None, "admin"),
            Err(SubmitError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_decision_is_illegal() {
        let (_store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));
        let _rx = coordinator.register(&run_id).unwrap();
        coordinator
            .submit_decision(&run_id, true, None, "admin")
            .unwrap();

        let err = coordinator
            .submit_decision(&run_id, false, Some("late".into()), "other")
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::IllegalDecision {
                status: ToolRunStatus::Approved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timeout_rejects_exactly_once() {
        let (store, coordinator, run_id) = coordinator_with_run(Duration::from_millis(40));
        let rx = coordinator.register(&run_id).unwrap();

        let outcome = coordinator
            .await_decision(&run_id, rx, &CancelToken::new())
            .await;
        assert!(matches!(outcome, WaitOutcome::TimedOut));

        let run = store.get_tool_run(&run_id).unwrap();
        assert_eq!(run.status, ToolRunStatus::Rejected);
        assert_eq!(run.rejection_reason.as_deref(), Some("timeout"));

        // A decision after the timeout is illegal, and only one REJECTED
        // transition exists in the audit log.
        assert!(coordinator
            .submit_decision(&run_id, true, None, "admin")
            .is_err());
        let rejections = store
            .list_workflow_logs(&run_id)
            .unwrap()
            .iter()
            .filter(|l| l.to_status == ToolRunStatus::Rejected)
            .count();
        assert_eq!(rejections, 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let (_store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));
        let rx = coordinator.register(&run_id).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = coordinator.await_decision(&run_id, rx, &cancel).await;
        assert!(matches!(outcome, WaitOutcome::Cancelled));
        assert_eq!(coordinator.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn sweep_drops_expired_grace_entries() {
        let (_store, coordinator, run_id) = coordinator_with_run(Duration::from_secs(60));
        coordinator
            .submit_decision(&run_id, true, None, "admin")
            .unwrap();

        // Force-expire the buffered entry, then sweep.
        {
            let mut early = coordinator.early.lock();
            if let Some(entry) = early.get_mut(&run_id) {
                entry.1 = Instant::now() - Duration::from_secs(1);
            }
        }
        coordinator.sweep_expired();
        assert!(coordinator.early.lock().is_empty());
    }
}
