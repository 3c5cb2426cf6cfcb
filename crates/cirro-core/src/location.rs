//! Storage location validation, resolution and per-bucket metadata caching.
//!
//! Every workflow path that points at remote storage goes through
//! [`LocationResolver::build`]. Building a location needs bucket-level
//! metadata (whether the bucket is requester-pays), and that lookup is a
//! network round trip, so the resolver memoizes it per bucket:
//!
//! - The first caller for a bucket performs the fetch.
//! - Concurrent callers for the same bucket await that one fetch.
//! - A failed fetch is not cached; the next caller fetches again.
//! - Successful entries are never evicted or refreshed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::observability::storage_span;
use crate::storage::{ObjectKey, RequestOptions, StorageBackend};

/// URI scheme accepted for remote storage locations.
pub const SCHEME: &str = "gs";

const SCHEME_PREFIX: &str = "gs://";

/// Why a path string cannot be a remote storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// The path has a URI scheme other than `gs`.
    BadScheme(String),
    /// The path could not be parsed as a URI at all.
    Unparseable(String),
    /// The path uses the `gs` scheme but no bucket could be recovered.
    MalformedBucket,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadScheme(scheme) => write!(f, "scheme '{scheme}' is not '{SCHEME}'"),
            Self::Unparseable(detail) => write!(f, "unparseable URI: {detail}"),
            Self::MalformedBucket => write!(f, "could not determine bucket name"),
        }
    }
}

/// Outcome of validating a path string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValidation {
    /// A complete remote location.
    Full {
        /// Bucket name.
        bucket: String,
        /// Object path within the bucket, starting with `/`.
        path: String,
    },
    /// No scheme; the caller may resolve the path against a base location.
    RelativeCandidate,
    /// Not a usable remote location.
    Invalid(InvalidReason),
}

fn bucket_pattern() -> Option<&'static Regex> {
    static PATTERN: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^gs://([^/]+)(/.*)?$").ok())
        .as_ref()
}

fn normalize_object_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Cuts the query and fragment off raw path text.
fn path_component(rest: &str) -> &str {
    rest.split(['?', '#']).next().unwrap_or_default()
}

fn recover_with_pattern(raw: &str) -> PathValidation {
    let Some(captures) = bucket_pattern().and_then(|p| p.captures(raw)) else {
        return PathValidation::Invalid(InvalidReason::MalformedBucket);
    };
    let Some(bucket) = captures.get(1) else {
        return PathValidation::Invalid(InvalidReason::MalformedBucket);
    };
    let path = captures.get(2).map_or("", |m| m.as_str());
    PathValidation::Full {
        bucket: bucket.as_str().to_string(),
        path: normalize_object_path(path_component(path)),
    }
}

/// Validates a path string as a remote storage location.
///
/// The bucket is taken from the URI host when the URI parser finds one.
/// Bucket names the parser rejects are recovered with a permissive
/// `gs://<bucket>/<path>` pattern. The returned path is the URI path
/// component: any port, query and fragment are dropped. Its text is kept
/// as written, so no percent-encoding is applied.
#[must_use]
pub fn validate(raw: &str) -> PathValidation {
    match url::Url::parse(raw) {
        Ok(url) => {
            if url.scheme() != SCHEME {
                return PathValidation::Invalid(InvalidReason::BadScheme(url.scheme().to_string()));
            }
            match url.host_str() {
                Some(host) if !host.is_empty() => {
                    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
                    let path = raw
                        .strip_prefix(SCHEME_PREFIX)
                        .and_then(|rest| rest.strip_prefix(host))
                        .and_then(|rest| rest.strip_prefix(port.as_str()))
                        .map_or_else(|| url.path(), path_component);
                    PathValidation::Full {
                        bucket: host.to_string(),
                        path: normalize_object_path(path),
                    }
                }
                _ => recover_with_pattern(raw),
            }
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => PathValidation::RelativeCandidate,
        Err(_) if raw.starts_with(SCHEME_PREFIX) => recover_with_pattern(raw),
        Err(e) => PathValidation::Invalid(InvalidReason::Unparseable(e.to_string())),
    }
}

/// Source of bucket-level metadata.
#[async_trait]
pub trait BucketMetadataSource: Send + Sync + 'static {
    /// Returns whether the bucket bills requesters for access.
    async fn requester_pays(&self, bucket: &str) -> Result<bool>;
}

/// Filesystem handle bound to one bucket and its billing attribution.
#[derive(Clone)]
pub struct BucketFileSystem {
    bucket: String,
    user_project: Option<String>,
    backend: Arc<dyn StorageBackend>,
}

impl fmt::Debug for BucketFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketFileSystem")
            .field("bucket", &self.bucket)
            .field("user_project", &self.user_project)
            .field("backend", &"<StorageBackend>")
            .finish()
    }
}

impl BucketFileSystem {
    /// Bucket this handle is bound to.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Project billed for requests, set only for requester-pays buckets.
    #[must_use]
    pub fn user_project(&self) -> Option<&str> {
        self.user_project.as_deref()
    }

    fn options(&self) -> RequestOptions {
        RequestOptions {
            user_project: self.user_project.clone(),
            content_type: None,
        }
    }
}

/// Cached metadata for one bucket.
#[derive(Debug)]
pub struct BucketMetadata {
    /// Whether the bucket is requester-pays.
    pub requester_pays: bool,
    /// Filesystem handle configured with the bucket's billing attribution.
    pub filesystem: BucketFileSystem,
}

/// A validated remote location bound to its bucket's filesystem handle.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    path: String,
    requester_pays: bool,
    filesystem: BucketFileSystem,
}

impl StorageLocation {
    /// Bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        self.filesystem.bucket()
    }

    /// Object path within the bucket, starting with `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the owning bucket is requester-pays.
    #[must_use]
    pub const fn requester_pays(&self) -> bool {
        self.requester_pays
    }

    /// Full `gs://bucket/path` rendering.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{SCHEME_PREFIX}{}{}", self.bucket(), self.path)
    }

    /// Object key addressed by this location.
    #[must_use]
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.bucket(), &self.path)
    }

    /// Returns the location of `child` beneath this one.
    #[must_use]
    pub fn resolve(&self, child: &str) -> Self {
        let child = child.trim_start_matches('/');
        if child.is_empty() {
            return self.clone();
        }
        Self {
            path: format!("{}/{child}", self.path.trim_end_matches('/')),
            requester_pays: self.requester_pays,
            filesystem: self.filesystem.clone(),
        }
    }

    /// Reads the object's content.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object does not exist, or a storage
    /// error if the backend fails.
    pub async fn read(&self) -> Result<Bytes> {
        self.filesystem
            .backend
            .get(&self.object_key(), &self.filesystem.options())
            .await
    }

    /// Reads the object's content as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the content is not UTF-8.
    pub async fn read_to_string(&self) -> Result<String> {
        let bytes = self.read().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Serialization {
            message: format!("{} is not valid UTF-8: {e}", self.uri()),
        })
    }

    /// Writes the object, replacing any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn write(&self, data: Bytes, content_type: Option<&str>) -> Result<()> {
        let mut options = self.filesystem.options();
        options.content_type = content_type.map(str::to_string);
        self.filesystem
            .backend
            .put(&self.object_key(), data, &options)
            .await?;
        Ok(())
    }

    /// Returns whether the object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata lookup fails.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self
            .filesystem
            .backend
            .head(&self.object_key(), &self.filesystem.options())
            .await?
            .is_some())
    }

    /// Lists every object beneath this location, treating it as a directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend listing fails.
    pub async fn list(&self) -> Result<Vec<Self>> {
        let key = self.object_key();
        let prefix = if key.name.is_empty() || key.name.ends_with('/') {
            key.name
        } else {
            format!("{}/", key.name)
        };
        let listed = self
            .filesystem
            .backend
            .list(self.bucket(), &prefix, &self.filesystem.options())
            .await?;

        Ok(listed
            .into_iter()
            .map(|meta| Self {
                path: format!("/{}", meta.key.name),
                requester_pays: self.requester_pays,
                filesystem: self.filesystem.clone(),
            })
            .collect())
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}{}", self.bucket(), self.path)
    }
}

/// Metric names emitted by the resolver.
pub mod metric_names {
    /// Counter: resolutions served from the bucket cache.
    pub const CACHE_HITS: &str = "cirro_location_cache_hits_total";
    /// Counter: bucket metadata fetches issued.
    pub const METADATA_FETCHES: &str = "cirro_location_metadata_fetches_total";
    /// Counter: bucket metadata fetches that failed.
    pub const METADATA_FETCH_FAILURES: &str = "cirro_location_metadata_fetch_failures_total";
}

type CacheSlot = Arc<OnceCell<Arc<BucketMetadata>>>;

/// Resolves path strings into [`StorageLocation`]s with a per-bucket
/// single-flight metadata cache.
pub struct LocationResolver {
    backend: Arc<dyn StorageBackend>,
    metadata: Arc<dyn BucketMetadataSource>,
    billing_project: Option<String>,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

impl fmt::Debug for LocationResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocationResolver")
            .field("billing_project", &self.billing_project)
            .field("cached_buckets", &self.cached_buckets())
            .finish_non_exhaustive()
    }
}

impl LocationResolver {
    /// Creates a resolver over a storage backend and a metadata source.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        metadata: Arc<dyn BucketMetadataSource>,
    ) -> Self {
        Self {
            backend,
            metadata,
            billing_project: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the project billed when accessing requester-pays buckets.
    #[must_use]
    pub fn with_billing_project(mut self, project: impl Into<String>) -> Self {
        self.billing_project = Some(project.into());
        self
    }

    /// Validates a path string. See [`validate`].
    #[must_use]
    pub fn validate(&self, raw: &str) -> PathValidation {
        validate(raw)
    }

    /// Number of buckets with a cache slot (resolved or in flight).
    #[must_use]
    pub fn cached_buckets(&self) -> usize {
        self.cache.lock().map_or(0, |cache| cache.len())
    }

    fn slot(&self, bucket: &str) -> Result<CacheSlot> {
        let mut cache = self.cache.lock().map_err(|_| Error::Internal {
            message: "location cache lock poisoned".into(),
        })?;
        Ok(Arc::clone(cache.entry(bucket.to_string()).or_default()))
    }

    /// Returns the metadata for `bucket`, fetching it at most once.
    ///
    /// # Errors
    ///
    /// Returns the metadata source's error. Failures are not cached.
    pub async fn resolve(&self, bucket: &str) -> Result<Arc<BucketMetadata>> {
        let slot = self.slot(bucket)?;
        if let Some(cached) = slot.get() {
            metrics::counter!(metric_names::CACHE_HITS).increment(1);
            return Ok(Arc::clone(cached));
        }

        let resolved = slot
            .get_or_try_init(|| self.fetch(bucket))
            .instrument(storage_span("resolve", bucket))
            .await?;
        Ok(Arc::clone(resolved))
    }

    async fn fetch(&self, bucket: &str) -> Result<Arc<BucketMetadata>> {
        metrics::counter!(metric_names::METADATA_FETCHES).increment(1);
        let requester_pays = match self.metadata.requester_pays(bucket).await {
            Ok(flag) => flag,
            Err(e) => {
                metrics::counter!(metric_names::METADATA_FETCH_FAILURES).increment(1);
                tracing::warn!(error = %e, "bucket metadata lookup failed");
                return Err(e);
            }
        };

        let user_project = if requester_pays {
            if self.billing_project.is_none() {
                tracing::warn!("bucket is requester pays but no billing project is configured");
            }
            self.billing_project.clone()
        } else {
            None
        };
        tracing::debug!(requester_pays, "resolved bucket metadata");

        Ok(Arc::new(BucketMetadata {
            requester_pays,
            filesystem: BucketFileSystem {
                bucket: bucket.to_string(),
                user_project,
                backend: Arc::clone(&self.backend),
            },
        }))
    }

    /// Builds a [`StorageLocation`] from a full `gs://` path.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLocation` for relative or invalid paths, or the
    /// metadata lookup error.
    pub async fn build(&self, raw: &str) -> Result<StorageLocation> {
        match validate(raw) {
            PathValidation::Full { bucket, path } => {
                let metadata = self.resolve(&bucket).await?;
                Ok(StorageLocation {
                    path,
                    requester_pays: metadata.requester_pays,
                    filesystem: metadata.filesystem.clone(),
                })
            }
            PathValidation::RelativeCandidate => Err(Error::invalid_location(
                raw,
                "relative path has no bucket",
            )),
            PathValidation::Invalid(reason) => {
                Err(Error::invalid_location(raw, reason.to_string()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FixedMetadata {
        requester_pays: HashSet<String>,
        failing: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BucketMetadataSource for FixedMetadata {
        async fn requester_pays(&self, bucket: &str) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(bucket) {
                return Err(Error::storage("metadata unavailable"));
            }
            Ok(self.requester_pays.contains(bucket))
        }
    }

    fn resolver(metadata: Arc<FixedMetadata>) -> (LocationResolver, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let resolver = LocationResolver::new(backend.clone(), metadata);
        (resolver, backend)
    }

    #[test]
    fn validate_full_location() {
        assert_eq!(
            validate("gs://bucket/a/b.txt"),
            PathValidation::Full {
                bucket: "bucket".into(),
                path: "/a/b.txt".into()
            }
        );
    }

    #[test]
    fn validate_bucket_only() {
        assert_eq!(
            validate("gs://bucket"),
            PathValidation::Full {
                bucket: "bucket".into(),
                path: "/".into()
            }
        );
    }

    #[test]
    fn validate_keeps_raw_path_text() {
        assert_eq!(
            validate("gs://bucket/dir with space/x"),
            PathValidation::Full {
                bucket: "bucket".into(),
                path: "/dir with space/x".into()
            }
        );
    }

    #[test]
    fn validate_drops_port_query_and_fragment() {
        let expected = PathValidation::Full {
            bucket: "bucket".into(),
            path: "/x/y.txt".into(),
        };
        assert_eq!(validate("gs://bucket/x/y.txt?generation=3"), expected);
        assert_eq!(validate("gs://bucket/x/y.txt#part"), expected);
        assert_eq!(validate("gs://bucket:1/x/y.txt"), expected);
        assert_eq!(
            validate("gs://bucket?alt=json"),
            PathValidation::Full {
                bucket: "bucket".into(),
                path: "/".into()
            }
        );
    }

    #[test]
    fn validate_relative_candidate() {
        assert_eq!(validate("relative/file.txt"), PathValidation::RelativeCandidate);
        assert_eq!(validate("/abs/local/file"), PathValidation::RelativeCandidate);
    }

    #[test]
    fn validate_rejects_other_schemes() {
        assert_eq!(
            validate("s3://bucket/key"),
            PathValidation::Invalid(InvalidReason::BadScheme("s3".into()))
        );
    }

    #[test]
    fn validate_rejects_missing_bucket() {
        assert_eq!(
            validate("gs:///no-bucket"),
            PathValidation::Invalid(InvalidReason::MalformedBucket)
        );
    }

    #[tokio::test]
    async fn build_binds_requester_pays_and_billing_project() {
        let metadata = Arc::new(FixedMetadata {
            requester_pays: HashSet::from(["paid".to_string()]),
            ..FixedMetadata::default()
        });
        let (resolver, backend) = resolver(metadata);
        let resolver = resolver.with_billing_project("billing");
        backend.set_requester_pays("paid").unwrap();

        let location = resolver.build("gs://paid/data/x.txt").await.unwrap();
        assert!(location.requester_pays());
        location.write(Bytes::from("payload"), None).await.unwrap();
        assert_eq!(location.read().await.unwrap(), Bytes::from("payload"));

        let free = resolver.build("gs://free/y").await.unwrap();
        assert!(!free.requester_pays());
    }

    #[tokio::test]
    async fn build_rejects_relative_path() {
        let (resolver, _) = resolver(Arc::new(FixedMetadata::default()));
        let err = resolver.build("local/file").await.unwrap_err();
        assert!(matches!(err, Error::InvalidLocation { .. }));
    }

    #[tokio::test]
    async fn resolve_caches_per_bucket() {
        let metadata = Arc::new(FixedMetadata::default());
        let (resolver, _) = resolver(metadata.clone());

        resolver.build("gs://a/1").await.unwrap();
        resolver.build("gs://a/2").await.unwrap();
        resolver.build("gs://b/1").await.unwrap();

        assert_eq!(metadata.calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached_buckets(), 2);
    }

    #[tokio::test]
    async fn failed_resolution_is_retried() {
        let metadata = Arc::new(FixedMetadata {
            failing: HashSet::from(["flaky".to_string()]),
            ..FixedMetadata::default()
        });
        let (resolver, _) = resolver(metadata.clone());

        assert!(resolver.resolve("flaky").await.is_err());
        assert!(resolver.resolve("flaky").await.is_err());
        assert_eq!(metadata.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn location_resolve_and_list() {
        let (resolver, _) = resolver(Arc::new(FixedMetadata::default()));
        let root = resolver.build("gs://bucket/wf/call").await.unwrap();

        let out = root.resolve("results/out.txt");
        assert_eq!(out.uri(), "gs://bucket/wf/call/results/out.txt");
        assert!(!out.exists().await.unwrap());

        out.write(Bytes::from("1"), Some("text/plain")).await.unwrap();
        root.resolve("results/other.txt")
            .write(Bytes::from("2"), None)
            .await
            .unwrap();
        assert!(out.exists().await.unwrap());

        let listed: Vec<String> = root
            .resolve("results")
            .list()
            .await
            .unwrap()
            .iter()
            .map(StorageLocation::uri)
            .collect();
        assert_eq!(
            listed,
            vec![
                "gs://bucket/wf/call/results/other.txt".to_string(),
                "gs://bucket/wf/call/results/out.txt".to_string(),
            ]
        );
    }
}
