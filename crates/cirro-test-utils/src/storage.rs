//! Test storage implementations with operation tracing.
//!
//! Provides an object store that records every operation and can inject
//! transient failures, and a bucket metadata source that counts lookups.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cirro_core::error::{Error, Result};
use cirro_core::location::BucketMetadataSource;
use cirro_core::storage::{MemoryBackend, ObjectKey, ObjectMeta, RequestOptions, StorageBackend};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Object that was read.
        uri: String,
    },
    /// Put operation.
    Put {
        /// Object that was written.
        uri: String,
        /// Size of data written.
        size: usize,
        /// Content type recorded on the object.
        content_type: Option<String>,
    },
    /// Delete operation.
    Delete {
        /// Object that was deleted.
        uri: String,
    },
    /// List operation.
    List {
        /// Bucket that was listed.
        bucket: String,
        /// Prefix that was listed.
        prefix: String,
    },
    /// Head operation.
    Head {
        /// Object that was checked.
        uri: String,
    },
}

#[derive(Debug)]
struct InjectedFailure {
    prefix: String,
    remaining: usize,
}

/// Splits `gs://bucket/name` into an object key.
///
/// # Panics
///
/// Panics if `uri` is not a `gs://` object path.
#[must_use]
pub fn object_key(uri: &str) -> ObjectKey {
    let rest = uri.strip_prefix("gs://").expect("gs:// uri");
    let (bucket, name) = rest.split_once('/').expect("object path");
    ObjectKey::new(bucket, name)
}

/// In-memory storage backend with operation tracing.
///
/// Wraps [`MemoryBackend`] and records every call for later assertion.
#[derive(Debug, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Mutex<Vec<StorageOp>>,
    failures: Mutex<Vec<InjectedFailure>>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails the next `times` operations on objects under `uri_prefix` with
    /// a transient storage error.
    pub fn inject_failures(&self, uri_prefix: impl Into<String>, times: usize) {
        self.failures.lock().expect("lock").push(InjectedFailure {
            prefix: uri_prefix.into(),
            remaining: times,
        });
    }

    /// Writes an object directly, bypassing tracing and failure injection.
    pub async fn seed(&self, uri: &str, contents: impl Into<Bytes>) {
        self.inner
            .put(&object_key(uri), contents.into(), &RequestOptions::default())
            .await
            .expect("seed object");
    }

    /// Reads an object directly, bypassing tracing and failure injection.
    pub async fn object(&self, uri: &str) -> Option<String> {
        self.inner
            .get(&object_key(uri), &RequestOptions::default())
            .await
            .ok()
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    /// Content type recorded on an object.
    pub async fn content_type(&self, uri: &str) -> Option<String> {
        self.inner
            .head(&object_key(uri), &RequestOptions::default())
            .await
            .ok()
            .flatten()
            .and_then(|meta| meta.content_type)
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, uri: &str) -> Result<()> {
        let mut failures = self.failures.lock().expect("lock");
        if let Some(failure) = failures
            .iter_mut()
            .find(|f| f.remaining > 0 && uri.starts_with(&f.prefix))
        {
            failure.remaining -= 1;
            return Err(Error::storage(format!("injected failure for {uri}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Bytes> {
        let uri = key.to_string();
        self.record(StorageOp::Get { uri: uri.clone() });
        self.check_failure(&uri)?;
        self.inner.get(key, options).await
    }

    async fn put(
        &self,
        key: &ObjectKey,
        data: Bytes,
        options: &RequestOptions,
    ) -> Result<ObjectMeta> {
        let uri = key.to_string();
        self.record(StorageOp::Put {
            uri: uri.clone(),
            size: data.len(),
            content_type: options.content_type.clone(),
        });
        self.check_failure(&uri)?;
        self.inner.put(key, data, options).await
    }

    async fn delete(&self, key: &ObjectKey, options: &RequestOptions) -> Result<()> {
        let uri = key.to_string();
        self.record(StorageOp::Delete { uri: uri.clone() });
        self.check_failure(&uri)?;
        self.inner.delete(key, options).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<ObjectMeta>> {
        self.record(StorageOp::List {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        });
        self.check_failure(&format!("gs://{bucket}/{prefix}"))?;
        self.inner.list(bucket, prefix, options).await
    }

    async fn head(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Option<ObjectMeta>> {
        let uri = key.to_string();
        self.record(StorageOp::Head { uri: uri.clone() });
        self.check_failure(&uri)?;
        self.inner.head(key, options).await
    }
}

/// Bucket metadata source that counts lookups.
#[derive(Debug, Default)]
pub struct CountingMetadataSource {
    requester_pays: Mutex<HashSet<String>>,
    lookups: AtomicUsize,
    failures: AtomicUsize,
    latency: Option<Duration>,
}

impl CountingMetadataSource {
    /// Creates a source where no bucket is requester-pays.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source whose lookups take `latency`.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Marks `bucket` as requester-pays.
    pub fn set_requester_pays(&self, bucket: impl Into<String>) {
        self.requester_pays
            .lock()
            .expect("lock")
            .insert(bucket.into());
    }

    /// Fails the next `times` lookups with a transient storage error.
    pub fn fail_next(&self, times: usize) {
        self.failures.store(times, Ordering::SeqCst);
    }

    /// Number of lookups issued so far.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BucketMetadataSource for CountingMetadataSource {
    async fn requester_pays(&self, bucket: &str) -> Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::storage(format!("injected metadata failure for {bucket}")));
        }
        Ok(self.requester_pays.lock().expect("lock").contains(bucket))
    }
}
