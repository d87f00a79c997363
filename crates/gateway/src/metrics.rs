//! Metric names and recorder setup.
//!
//! Counters and histograms go through the `metrics` facade; the Prometheus
//! recorder renders them at `GET /metrics`. Tool-run transitions are
//! additionally audited durably by the store (`workflow_logs`) — the
//! counters here are operational, not the audit trail.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CHAT_MESSAGES_TOTAL: &str = "chat_messages_total";
pub const TOOL_RUNS_REQUESTED_TOTAL: &str = "tool_runs_requested_total";
pub const TOOL_RUNS_APPROVED_TOTAL: &str = "tool_runs_approved_total";
pub const TOOL_RUNS_REJECTED_TOTAL: &str = "tool_runs_rejected_total";
pub const TOOL_RUNS_EXECUTED_TOTAL: &str = "tool_runs_executed_total";
pub const ROUTER_DECISIONS_TOTAL: &str = "router_decisions_total";
pub const SESSION_EVENTS_DROPPED_TOTAL: &str = "session_events_dropped_total";
pub const TURN_DURATION_MS: &str = "turn_duration_ms";
pub const LLM_FIRST_CHUNK_MS: &str = "llm_first_chunk_ms";
pub const APPROVAL_WAIT_MS: &str = "approval_wait_ms";

/// Install the Prometheus recorder and describe every metric once.
/// Returns the handle used by the `/metrics` endpoint to render the text
/// exposition.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(CHAT_MESSAGES_TOTAL, "Messages persisted by role");
    describe_counter!(TOOL_RUNS_REQUESTED_TOTAL, "Tool runs created");
    describe_counter!(TOOL_RUNS_APPROVED_TOTAL, "Tool runs approved");
    describe_counter!(TOOL_RUNS_REJECTED_TOTAL, "Tool runs rejected");
    describe_counter!(TOOL_RUNS_EXECUTED_TOTAL, "Tool runs executed to completion");
    describe_counter!(
        ROUTER_DECISIONS_TOTAL,
        "Router decisions by strategy and outcome"
    );
    describe_counter!(
        SESSION_EVENTS_DROPPED_TOTAL,
        "Outbound session events dropped under queue pressure"
    );
    describe_histogram!(TURN_DURATION_MS, "End-to-end turn duration");
    describe_histogram!(LLM_FIRST_CHUNK_MS, "Latency to the first streamed chunk");
    describe_histogram!(APPROVAL_WAIT_MS, "Time a turn spent awaiting approval");

    Ok(handle)
}

pub fn record_chat_message(role: &'static str) {
    counter!(CHAT_MESSAGES_TOTAL, "role" => role).increment(1);
}

pub fn record_router_decision(strategy: &'static str, outcome: &'static str) {
    counter!(ROUTER_DECISIONS_TOTAL, "strategy" => strategy, "outcome" => outcome).increment(1);
}

pub fn record_turn_duration(ms: f64) {
    histogram!(TURN_DURATION_MS).record(ms);
}

pub fn record_first_chunk(ms: f64) {
    histogram!(LLM_FIRST_CHUNK_MS).record(ms);
}

pub fn record_approval_wait(ms: f64) {
    histogram!(APPROVAL_WAIT_MS).record(ms);
}
