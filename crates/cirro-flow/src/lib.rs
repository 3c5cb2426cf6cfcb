//! # cirro-flow
//!
//! Call-attempt orchestration for the cirro batch-compute backend.
//!
//! This crate takes one call attempt from submission to a terminal outcome:
//!
//! - **Submission**: Runtime declarations become a run request with an I/O plan
//! - **Polling**: Status is polled with backoff until the run is terminal
//! - **Classification**: Terminal statuses map to success, retryable or fatal outcomes
//! - **Retry Accounting**: Preemption and unexpected-termination counters persist across attempts
//! - **Reconnect**: A restarted process re-attaches to runs it submitted earlier
//!
//! ## Core Concepts
//!
//! - **Call attempt**: One try at running a call, identified by workflow, call,
//!   shard and attempt number
//! - **Run**: The compute backend's execution of an attempt, addressed by a
//!   [`compute::RunHandle`]
//! - **Ledger**: Attempt-scoped counters that decide whether the next attempt
//!   may use a preemptible VM
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use cirro_flow::error::Result;
//! use cirro_flow::runtime::{RuntimeDefaults, RuntimeParameters};
//!
//! # fn main() -> Result<()> {
//! let mut declarations = BTreeMap::new();
//! declarations.insert("docker".to_string(), serde_json::json!("ubuntu:22.04"));
//! declarations.insert("preemptible".to_string(), serde_json::json!(3));
//!
//! let runtime = RuntimeParameters::from_declarations(&declarations, &RuntimeDefaults::default())?;
//! assert!(runtime.preemptible_eligible());
//! assert_eq!(runtime.working_disk()?.mount_point, "/cirro_root");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod attempt;
pub mod backoff;
pub mod compute;
pub mod config;
pub mod error;
pub mod io_plan;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod runtime;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::attempt::CallAttempt;
    pub use crate::backoff::{Backoff, BackoffPolicy};
    pub use crate::compute::{ComputeClient, ErrorCode, RunHandle, RunRequest, RunStatus};
    pub use crate::config::BackendConfig;
    pub use crate::error::{Error, Result};
    pub use crate::io_plan::{
        FileReference, InputDeclaration, IoPlan, IoPlanner, MappedOutput, OutputDeclaration,
        OutputFile, OutputValue,
    };
    pub use crate::job::{
        AttemptBackend, AttemptHandle, AttemptOutcome, AttemptState, FailureKind, JobAttempt,
        JobDescription, Reconnect,
    };
    pub use crate::ledger::{InMemoryKeyValueStore, KeyValueStore, RetryCounters, RetryLedger};
    pub use crate::metrics::FlowMetrics;
    pub use crate::runtime::{RuntimeDefaults, RuntimeParameters};
}
