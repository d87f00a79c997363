//! Identifier and timestamp helpers.
//!
//! Every persisted entity gets an opaque UUIDv4 string id. Timestamps are
//! UTC. A process-wide monotonic counter breaks ties where wall-clock
//! resolution is not enough (message ordering within one millisecond).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

static MONOTONIC: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh opaque identifier (UUIDv4, lowercase hyphenated).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Process-wide strictly increasing counter. Never returns the same value
/// twice within one process.
pub fn next_monotonic() -> u64 {
    MONOTONIC.fetch_add(1, Ordering::Relaxed)
}
