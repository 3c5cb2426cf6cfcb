//! Storage backend abstraction for bucketed object storage.
//!
//! This module defines the object storage contract used by the storage
//! location resolver and the call-attempt orchestrator:
//! - Whole-object reads and writes
//! - Prefix listing within a bucket
//! - Metadata lookups without reading content
//!
//! ## Requester pays
//!
//! Every request carries [`RequestOptions`]. When a bucket is configured as
//! requester-pays, the request must name the project that is billed for the
//! access (`user_project`). The in-memory backend enforces this so tests can
//! observe that billing attribution is threaded through.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Identifies one object: a bucket plus an object name (no leading slash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object name within the bucket.
    pub name: String,
}

impl ObjectKey {
    /// Creates a new object key, stripping any leading slash from `name`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, name: impl AsRef<str>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.as_ref().trim_start_matches('/').to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.name)
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Project billed for requester-pays buckets.
    pub user_project: Option<String>,
    /// Content type recorded on writes.
    pub content_type: Option<String>,
}

impl RequestOptions {
    /// Sets the billed project.
    #[must_use]
    pub fn with_user_project(mut self, project: impl Into<String>) -> Self {
        self.user_project = Some(project.into());
        self
    }

    /// Sets the content type used for writes.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object key.
    pub key: ObjectKey,
    /// Object size in bytes.
    pub size: u64,
    /// Object generation token.
    pub generation: String,
    /// Content type recorded at write time.
    pub content_type: Option<String>,
    /// Last modification timestamp.
    pub updated: Option<DateTime<Utc>>,
}

/// Storage backend trait for bucketed object storage.
///
/// All storage backends (GCS, memory) implement this trait.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Bytes>;

    /// Writes an object unconditionally, returning its new metadata.
    async fn put(
        &self,
        key: &ObjectKey,
        data: Bytes,
        options: &RequestOptions,
    ) -> Result<ObjectMeta>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, key: &ObjectKey, options: &RequestOptions) -> Result<()>;

    /// Lists objects in `bucket` whose name starts with `prefix`.
    ///
    /// Results are sorted by object name.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<ObjectKey, StoredObject>>>,
    requester_pays: Arc<RwLock<HashSet<String>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: i64,
    content_type: Option<String>,
    updated: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, key: &ObjectKey) -> ObjectMeta {
        ObjectMeta {
            key: key.clone(),
            size: self.data.len() as u64,
            generation: self.generation.to_string(),
            content_type: self.content_type.clone(),
            updated: Some(self.updated),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a bucket as requester-pays; requests without a billed project fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn set_requester_pays(&self, bucket: impl Into<String>) -> Result<()> {
        self.requester_pays
            .write()
            .map_err(|_| poisoned())?
            .insert(bucket.into());
        Ok(())
    }

    /// Returns whether a bucket was marked requester-pays.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn is_requester_pays(&self, bucket: &str) -> Result<bool> {
        Ok(self
            .requester_pays
            .read()
            .map_err(|_| poisoned())?
            .contains(bucket))
    }

    fn check_billing(&self, bucket: &str, options: &RequestOptions) -> Result<()> {
        if options.user_project.is_none() && self.is_requester_pays(bucket)? {
            return Err(Error::storage(format!(
                "bucket {bucket} is requester pays and no user project was provided"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Bytes> {
        self.check_billing(&key.bucket, options)?;
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {key}")))
    }

    async fn put(
        &self,
        key: &ObjectKey,
        data: Bytes,
        options: &RequestOptions,
    ) -> Result<ObjectMeta> {
        self.check_billing(&key.bucket, options)?;
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let generation = objects.get(key).map_or(1, |o| o.generation + 1);
        let stored = StoredObject {
            data,
            generation,
            content_type: options.content_type.clone(),
            updated: Utc::now(),
        };
        let meta = stored.meta(key);
        objects.insert(key.clone(), stored);
        drop(objects);

        Ok(meta)
    }

    async fn delete(&self, key: &ObjectKey, options: &RequestOptions) -> Result<()> {
        self.check_billing(&key.bucket, options)?;
        self.objects.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<ObjectMeta>> {
        self.check_billing(bucket, options)?;
        let objects = self.objects.read().map_err(|_| poisoned())?;

        let mut listed: Vec<ObjectMeta> = objects
            .iter()
            .filter(|(k, _)| k.bucket == bucket && k.name.starts_with(prefix))
            .map(|(k, o)| o.meta(k))
            .collect();
        drop(objects);
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn head(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Option<ObjectMeta>> {
        self.check_billing(&key.bucket, options)?;
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(key).map(|o| o.meta(key)))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("bucket", name)
    }

    #[test]
    fn object_key_strips_leading_slash() {
        let key = ObjectKey::new("b", "/wf/call/rc");
        assert_eq!(key.name, "wf/call/rc");
        assert_eq!(key.to_string(), "gs://b/wf/call/rc");
    }

    #[tokio::test]
    async fn memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");
        let opts = RequestOptions::default();

        let meta = backend
            .put(&key("test/file.txt"), data.clone(), &opts)
            .await
            .expect("put should succeed");
        assert_eq!(meta.generation, "1");

        let retrieved = backend
            .get(&key("test/file.txt"), &opts)
            .await
            .expect("get should succeed");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn put_bumps_generation_and_records_content_type() {
        let backend = MemoryBackend::new();
        let opts = RequestOptions::default().with_content_type("text/plain");

        backend.put(&key("a"), Bytes::from("1"), &opts).await.unwrap();
        let meta = backend.put(&key("a"), Bytes::from("2"), &opts).await.unwrap();

        assert_eq!(meta.generation, "2");
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let backend = MemoryBackend::new();
        let result = backend.get(&key("missing"), &RequestOptions::default()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn list_with_prefix_is_sorted_and_bucket_scoped() {
        let backend = MemoryBackend::new();
        let opts = RequestOptions::default();

        backend.put(&key("a/2.txt"), Bytes::from("a2"), &opts).await.unwrap();
        backend.put(&key("a/1.txt"), Bytes::from("a1"), &opts).await.unwrap();
        backend.put(&key("b/1.txt"), Bytes::from("b1"), &opts).await.unwrap();
        backend
            .put(&ObjectKey::new("other", "a/3.txt"), Bytes::from("x"), &opts)
            .await
            .unwrap();

        let listed = backend.list("bucket", "a/", &opts).await.unwrap();
        let names: Vec<_> = listed.iter().map(|m| m.key.name.as_str()).collect();
        assert_eq!(names, vec!["a/1.txt", "a/2.txt"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        let opts = RequestOptions::default();

        backend.put(&key("del.txt"), Bytes::from("data"), &opts).await.unwrap();
        assert!(backend.head(&key("del.txt"), &opts).await.unwrap().is_some());

        backend.delete(&key("del.txt"), &opts).await.unwrap();
        backend.delete(&key("del.txt"), &opts).await.unwrap();
        assert!(backend.head(&key("del.txt"), &opts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requester_pays_bucket_requires_user_project() {
        let backend = MemoryBackend::new();
        backend.set_requester_pays("bucket").unwrap();

        let denied = backend
            .put(&key("x"), Bytes::from("x"), &RequestOptions::default())
            .await;
        assert!(matches!(denied, Err(Error::Storage { .. })));

        let billed = RequestOptions::default().with_user_project("billing-project");
        backend.put(&key("x"), Bytes::from("x"), &billed).await.unwrap();
        assert_eq!(backend.get(&key("x"), &billed).await.unwrap(), Bytes::from("x"));
    }
}
