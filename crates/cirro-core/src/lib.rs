//! # cirro-core
//!
//! Core abstractions for the cirro batch-compute call orchestrator.
//!
//! This crate provides the storage-facing primitives the orchestrator builds on:
//!
//! - **Storage Traits**: Object storage backend interface and in-memory backend
//! - **Storage Locations**: `gs://` path validation and per-bucket metadata caching
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use cirro_core::prelude::*;
//!
//! assert_eq!(
//!     validate("gs://bucket/wf/call/stdout"),
//!     PathValidation::Full { bucket: "bucket".into(), path: "/wf/call/stdout".into() },
//! );
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
#[cfg(feature = "gcp")]
pub mod gcs;
pub mod location;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use cirro_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::location::{
        BucketFileSystem, BucketMetadata, BucketMetadataSource, InvalidReason, LocationResolver,
        PathValidation, StorageLocation, validate,
    };
    pub use crate::storage::{MemoryBackend, ObjectKey, ObjectMeta, RequestOptions, StorageBackend};
}

pub use error::{Error, Result};
pub use location::{LocationResolver, StorageLocation};
pub use storage::{MemoryBackend, StorageBackend};
