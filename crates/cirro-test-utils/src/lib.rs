//! Shared test utilities for cirro integration tests.
//!
//! This crate provides:
//! - [`ScriptedComputeClient`]: Compute client replaying queued responses
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording
//! - [`RecordingKeyValueStore`]: Ledger store with failure injection
//! - [`TestContext`]: Pre-configured test environment
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use cirro_test_utils::{TestContext, assert_succeeded};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let description = ctx.description("wf.hello").build();
//!     // ... script the compute client, run the attempt ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod compute;
pub mod fixtures;
pub mod ledger;
pub mod storage;

pub use assertions::*;
pub use compute::*;
pub use fixtures::*;
pub use ledger::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("cirro=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
