//! Cooperative cancellation.
//!
//! Each running turn gets a `CancelToken`. The runner checks it at every
//! suspension point; the LLM client checks it between chunks; the approval
//! wait selects on it so a 15-minute wait can be interrupted immediately.

use tokio_util::sync::CancellationToken;

/// A cancellation token shared between a turn and everything it spawns.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolve when cancellation is requested. Used at long suspension
    /// points (approval waits) where polling would be wasteful.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
