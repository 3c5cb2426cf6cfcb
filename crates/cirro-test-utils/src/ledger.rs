//! Key-value store double for the retry ledger.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cirro_flow::attempt::CallAttempt;
use cirro_flow::error::{Error, Result};
use cirro_flow::ledger::{
    InMemoryKeyValueStore, KeyValueStore, PREEMPTION_COUNT_KEY, RetryCounters, ScopedKey,
    UNEXPECTED_RETRY_COUNT_KEY,
};

/// In-memory store that records batches and can fail on demand.
#[derive(Debug, Default)]
pub struct RecordingKeyValueStore {
    inner: InMemoryKeyValueStore,
    batches: Mutex<Vec<Vec<(ScopedKey, String)>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl RecordingKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Batches written so far, including failed ones.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<(ScopedKey, String)>> {
        self.batches.lock().expect("lock").clone()
    }

    /// Stores counters for `attempt` directly.
    pub async fn seed(&self, attempt: &CallAttempt, counters: RetryCounters) {
        let entries = vec![
            (
                ScopedKey::new(attempt, PREEMPTION_COUNT_KEY),
                counters.preemption_count.to_string(),
            ),
            (
                ScopedKey::new(attempt, UNEXPECTED_RETRY_COUNT_KEY),
                counters.unexpected_retry_count.to_string(),
            ),
        ];
        self.inner.put_all(entries).await.expect("seed counters");
    }

    /// Counters stored for `attempt`, if any were written.
    #[must_use]
    pub fn counters_for(&self, attempt: &CallAttempt) -> Option<RetryCounters> {
        let snapshot: HashMap<ScopedKey, String> = self.inner.snapshot();
        let read = |key: &str| {
            snapshot
                .get(&ScopedKey::new(attempt, key))
                .map(|value| value.parse::<u32>().expect("numeric counter"))
        };
        let preemption_count = read(PREEMPTION_COUNT_KEY);
        let unexpected_retry_count = read(UNEXPECTED_RETRY_COUNT_KEY);
        if preemption_count.is_none() && unexpected_retry_count.is_none() {
            return None;
        }
        Some(RetryCounters {
            preemption_count: preemption_count.unwrap_or(0),
            unexpected_retry_count: unexpected_retry_count.unwrap_or(0),
        })
    }
}

#[async_trait]
impl KeyValueStore for RecordingKeyValueStore {
    async fn get(&self, key: &ScopedKey) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::backend(format!("injected read failure for {key}")));
        }
        self.inner.get(key).await
    }

    async fn put_all(&self, entries: Vec<(ScopedKey, String)>) -> Result<()> {
        self.batches.lock().expect("lock").push(entries.clone());
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::backend("injected write failure"));
        }
        self.inner.put_all(entries).await
    }
}
