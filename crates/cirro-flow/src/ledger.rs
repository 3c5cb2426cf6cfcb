//! Retry and preemption ledger.
//!
//! Preemptions and unexpected terminations of a call are counted across
//! attempts. The counters live in an external key-value store, keyed by the
//! attempt they apply to:
//!
//! - An attempt reads the counters written for it by its predecessor.
//! - A retryable failure writes the updated counters for `attempt + 1`.
//!
//! Reads fail open: a missing or unreadable counter is zero. Writes are
//! best-effort: a failed write is logged and the attempt outcome stands.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attempt::CallAttempt;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

/// Key holding the preemption count.
pub const PREEMPTION_COUNT_KEY: &str = "preemption_count";

/// Key holding the unexpected-termination retry count.
pub const UNEXPECTED_RETRY_COUNT_KEY: &str = "unexpected_retry_count";

/// A key scoped to one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedKey {
    /// Workflow instance.
    pub workflow_id: Uuid,
    /// Fully qualified call name.
    pub call: String,
    /// Scatter shard index.
    pub shard_index: Option<u32>,
    /// Attempt number.
    pub attempt: u32,
    /// Key name within the attempt scope.
    pub key: String,
}

impl ScopedKey {
    /// Creates a key scoped to `attempt`.
    #[must_use]
    pub fn new(attempt: &CallAttempt, key: impl Into<String>) -> Self {
        Self {
            workflow_id: attempt.workflow_id,
            call: attempt.call.clone(),
            shard_index: attempt.shard_index,
            attempt: attempt.attempt,
            key: key.into(),
        }
    }
}

impl fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shard = self
            .shard_index
            .map_or_else(|| "-1".to_string(), |s| s.to_string());
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.workflow_id, self.call, shard, self.attempt, self.key
        )
    }
}

/// External store for attempt-scoped values.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Reads one value.
    async fn get(&self, key: &ScopedKey) -> Result<Option<String>>;

    /// Writes several values in one batch.
    async fn put_all(&self, entries: Vec<(ScopedKey, String)>) -> Result<()>;
}

/// In-memory key-value store for testing and single-process use.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyValueStore {
    values: Arc<RwLock<HashMap<ScopedKey, String>>>,
}

impl InMemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every stored value.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<ScopedKey, String> {
        self.values
            .read()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

fn poisoned() -> Error {
    Error::backend("key-value store lock poisoned")
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &ScopedKey) -> Result<Option<String>> {
        Ok(self.values.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    async fn put_all(&self, entries: Vec<(ScopedKey, String)>) -> Result<()> {
        self.values.write().map_err(|_| poisoned())?.extend(entries);
        Ok(())
    }
}

/// Counters carried from one attempt to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryCounters {
    /// Times the call was preempted.
    pub preemption_count: u32,
    /// Times the call terminated unexpectedly.
    pub unexpected_retry_count: u32,
}

impl RetryCounters {
    /// Counters after one more preemption.
    #[must_use]
    pub const fn preempted(self) -> Self {
        Self {
            preemption_count: self.preemption_count.saturating_add(1),
            unexpected_retry_count: self.unexpected_retry_count,
        }
    }

    /// Counters after one more unexpected termination.
    #[must_use]
    pub const fn unexpectedly_terminated(self) -> Self {
        Self {
            preemption_count: self.preemption_count,
            unexpected_retry_count: self.unexpected_retry_count.saturating_add(1),
        }
    }
}

/// Reads and writes [`RetryCounters`] through a [`KeyValueStore`].
#[derive(Clone)]
pub struct RetryLedger {
    store: Arc<dyn KeyValueStore>,
    metrics: FlowMetrics,
}

impl fmt::Debug for RetryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLedger")
            .field("store", &"<KeyValueStore>")
            .finish_non_exhaustive()
    }
}

impl RetryLedger {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            metrics: FlowMetrics::new(),
        }
    }

    async fn read_counter(&self, attempt: &CallAttempt, key: &str) -> u32 {
        let scoped = ScopedKey::new(attempt, key);
        match self.store.get(&scoped).await {
            Ok(Some(value)) => value.trim().parse().unwrap_or_else(|e| {
                tracing::warn!(key = %scoped, value = %value, error = %e, "unparseable retry counter, using 0");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(key = %scoped, error = %e, "failed to read retry counter, using 0");
                0
            }
        }
    }

    /// Reads the counters for `attempt`. Never fails.
    #[tracing::instrument(skip(self), fields(attempt = %attempt))]
    pub async fn read(&self, attempt: &CallAttempt) -> RetryCounters {
        RetryCounters {
            preemption_count: self.read_counter(attempt, PREEMPTION_COUNT_KEY).await,
            unexpected_retry_count: self
                .read_counter(attempt, UNEXPECTED_RETRY_COUNT_KEY)
                .await,
        }
    }

    /// Writes `counters` for `next_attempt` in one batch.
    ///
    /// Returns false if the write failed; the failure is logged and otherwise
    /// ignored.
    #[tracing::instrument(skip(self), fields(attempt = %next_attempt))]
    pub async fn write(&self, next_attempt: &CallAttempt, counters: RetryCounters) -> bool {
        let entries = vec![
            (
                ScopedKey::new(next_attempt, PREEMPTION_COUNT_KEY),
                counters.preemption_count.to_string(),
            ),
            (
                ScopedKey::new(next_attempt, UNEXPECTED_RETRY_COUNT_KEY),
                counters.unexpected_retry_count.to_string(),
            ),
        ];

        match self.store.put_all(entries).await {
            Ok(()) => {
                tracing::debug!(?counters, "retry counters written");
                true
            }
            Err(e) => {
                self.metrics.record_ledger_write_failure();
                tracing::warn!(error = %e, ?counters, "failed to write retry counters");
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl KeyValueStore for FailingStore {
        async fn get(&self, _key: &ScopedKey) -> Result<Option<String>> {
            Err(Error::transient("store unavailable"))
        }

        async fn put_all(&self, _entries: Vec<(ScopedKey, String)>) -> Result<()> {
            Err(Error::transient("store unavailable"))
        }
    }

    fn attempt() -> CallAttempt {
        CallAttempt::new(Uuid::nil(), "wf.call").with_shard(2)
    }

    #[tokio::test]
    async fn absent_counters_read_as_zero() {
        let ledger = RetryLedger::new(Arc::new(InMemoryKeyValueStore::new()));
        assert_eq!(ledger.read(&attempt()).await, RetryCounters::default());
    }

    #[tokio::test]
    async fn write_then_read_next_attempt() {
        let store = InMemoryKeyValueStore::new();
        let ledger = RetryLedger::new(Arc::new(store.clone()));
        let counters = RetryCounters {
            preemption_count: 2,
            unexpected_retry_count: 1,
        };

        assert!(ledger.write(&attempt().next(), counters).await);
        assert_eq!(ledger.read(&attempt().next()).await, counters);
        assert_eq!(ledger.read(&attempt()).await, RetryCounters::default());

        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.get(&ScopedKey::new(&attempt().next(), PREEMPTION_COUNT_KEY)),
            Some(&"2".to_string())
        );
    }

    #[tokio::test]
    async fn failing_store_is_tolerated() {
        let ledger = RetryLedger::new(Arc::new(FailingStore));
        assert_eq!(ledger.read(&attempt()).await, RetryCounters::default());
        assert!(!ledger.write(&attempt().next(), RetryCounters::default()).await);
    }

    #[tokio::test]
    async fn unparseable_counter_reads_as_zero() {
        let store = InMemoryKeyValueStore::new();
        store
            .put_all(vec![
                (ScopedKey::new(&attempt(), PREEMPTION_COUNT_KEY), "lots".into()),
                (ScopedKey::new(&attempt(), UNEXPECTED_RETRY_COUNT_KEY), "1".into()),
            ])
            .await
            .unwrap();
        let ledger = RetryLedger::new(Arc::new(store));

        assert_eq!(
            ledger.read(&attempt()).await,
            RetryCounters {
                preemption_count: 0,
                unexpected_retry_count: 1,
            }
        );
    }

    #[test]
    fn counter_increments_are_independent() {
        let counters = RetryCounters::default().preempted().preempted();
        assert_eq!(counters.preemption_count, 2);
        assert_eq!(counters.unexpected_retry_count, 0);
        let counters = counters.unexpectedly_terminated();
        assert_eq!(counters.preemption_count, 2);
        assert_eq!(counters.unexpected_retry_count, 1);
    }

    #[test]
    fn scoped_key_display() {
        let key = ScopedKey::new(&attempt(), PREEMPTION_COUNT_KEY);
        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000000/wf.call/2/1/preemption_count"
        );
    }
}
