//! Per-model client pool with bounded in-flight admission.
//!
//! Each model id maps to a client plus a semaphore capping concurrent
//! streams. Excess turns wait FIFO; waits longer than the admission
//! timeout fail with [`PoolError::Overloaded`] so callers can surface
//! `overloaded` instead of queueing forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::traits::LlmClient;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no client registered for model {0:?} and no default")]
    UnknownModel(String),

    #[error("admission queue timed out for model {0:?}")]
    Overloaded(String),
}

struct PoolEntry {
    client: Arc<dyn LlmClient>,
    permits: Arc<Semaphore>,
}

/// A client checked out of the pool. Holding it holds the in-flight
/// permit; dropping it re-admits the next waiter.
pub struct LeasedClient {
    pub client: Arc<dyn LlmClient>,
    _permit: OwnedSemaphorePermit,
}

pub struct ClientPool {
    entries: RwLock<HashMap<String, PoolEntry>>,
    /// Model used when a requested model id has no dedicated entry.
    default_model: String,
    max_in_flight: usize,
    admission_timeout: Duration,
}

impl ClientPool {
    pub fn new(default_model: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_model: default_model.into(),
            max_in_flight: max_in_flight.max(1),
            admission_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Register a client for a model id. Replaces any previous entry
    /// (its in-flight permits drain independently).
    pub fn register(&self, model_id: impl Into<String>, client: Arc<dyn LlmClient>) {
        let model_id = model_id.into();
        self.entries.write().insert(
            model_id.clone(),
            PoolEntry {
                client,
                permits: Arc::new(Semaphore::new(self.max_in_flight)),
            },
        );
        tracing::debug!(model_id, max_in_flight = self.max_in_flight, "LLM client registered");
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Check a client out for one stream, waiting FIFO for a permit up to
    /// the admission timeout.
    pub async fn acquire(&self, model_id: &str) -> Result<LeasedClient, PoolError> {
        let (client, permits) = {
            let entries = self.entries.read();
            let entry = entries
                .get(model_id)
                .or_else(|| entries.get(&self.default_model))
                .ok_or_else(|| PoolError::UnknownModel(model_id.to_owned()))?;
            (entry.client.clone(), entry.permits.clone())
        };

        let permit = tokio::time::timeout(self.admission_timeout, permits.acquire_owned())
            .await
            .map_err(|_| PoolError::Overloaded(model_id.to_owned()))?
            .map_err(|_| PoolError::Overloaded(model_id.to_owned()))?;

        Ok(LeasedClient {
            client,
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_domain::cancel::CancelToken;
    use parley_domain::error::Result;
    use parley_domain::stream::{BoxStream, LlmEvent};
    use crate::traits::StreamRequest;

    struct NullClient;

    #[async_trait::async_trait]
    impl LlmClient for NullClient {
        async fn stream(
            &self,
            _req: StreamRequest,
            _cancel: CancelToken,
        ) -> Result<BoxStream<'static, LlmEvent>> {
            Ok(Box::pin(futures_util::stream::empty()))
        }

        fn client_id(&self) -> &str {
            "null"
        }
    }

    #[tokio::test]
    async fn unknown_model_without_default_fails() {
        let pool = ClientPool::new("main", 2);
        assert!(matches!(
            pool.acquire("other").await,
            Err(PoolError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_default() {
        let pool = ClientPool::new("main", 2);
        pool.register("main", Arc::new(NullClient));
        let lease = pool.acquire("gpt-unknown").await.unwrap();
        assert_eq!(lease.client.client_id(), "null");
    }

    #[tokio::test]
    async fn admission_times_out_when_saturated() {
        let pool = ClientPool::new("main", 1)
            .with_admission_timeout(Duration::from_millis(50));
        pool.register("main", Arc::new(NullClient));

        let held = pool.acquire("main").await.unwrap();
        let second = pool.acquire("main").await;
        assert!(matches!(second, Err(PoolError::Overloaded(_))));

        drop(held);
        assert!(pool.acquire("main").await.is_ok());
    }

    #[tokio::test]
    async fn waiters_admit_in_order_once_freed() {
        let pool = Arc::new(
            ClientPool::new("main", 1).with_admission_timeout(Duration::from_secs(5)),
        );
        pool.register("main", Arc::new(NullClient));

        let held = pool.acquire("main").await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("main").await.is_ok() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
