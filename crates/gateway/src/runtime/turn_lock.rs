//! Per-conversation turn serialization.
//!
//! At most one turn runs per conversation at any instant. A second
//! `send_message` while a turn is in flight is rejected immediately with
//! `busy` — it is not queued.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Error returned when a turn is already in flight for the conversation.
#[derive(Debug)]
pub struct TurnBusy;

impl std::fmt::Display for TurnBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a turn is already in flight for this conversation")
    }
}

impl std::error::Error for TurnBusy {}

/// Maps each conversation id to a one-permit semaphore. The permit is held
/// by the runner task for the whole turn and auto-releases on drop.
pub struct TurnLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for TurnLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the turn lock without waiting. `Err(TurnBusy)` when a turn
    /// holds it.
    pub fn try_acquire(&self, conversation_id: &str) -> Result<OwnedSemaphorePermit, TurnBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.try_acquire_owned().map_err(|_| TurnBusy)
    }

    /// Number of tracked conversations (monitoring).
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Drop entries whose permit is free. Called periodically so finished
    /// conversations do not accumulate forever.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy() {
        let map = TurnLockMap::new();
        let permit = map.try_acquire("c1").unwrap();
        assert!(map.try_acquire("c1").is_err());
        drop(permit);
        assert!(map.try_acquire("c1").is_ok());
    }

    #[test]
    fn different_conversations_are_independent() {
        let map = TurnLockMap::new();
        let _p1 = map.try_acquire("c1").unwrap();
        let _p2 = map.try_acquire("c2").unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn prune_keeps_held_locks() {
        let map = TurnLockMap::new();
        let permit = map.try_acquire("held").unwrap();
        let released = map.try_acquire("released").unwrap();
        drop(released);

        map.prune_idle();
        assert_eq!(map.len(), 1);
        assert!(map.try_acquire("held").is_err());
        drop(permit);
    }
}
