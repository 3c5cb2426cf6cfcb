//! Compute backend abstraction.
//!
//! This module provides:
//!
//! - [`ComputeClient`]: Trait for submitting, polling and aborting runs
//! - [`RunRequest`]: Serializable description of one VM run
//! - [`RunStatus`]: Status of a submitted run
//! - [`ErrorCode`]: Canonical status codes reported by the backend
//!
//! With the `gcp` feature, [`pipelines`] provides the Pipelines API client.

#[cfg(feature = "gcp")]
pub mod pipelines;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attempt::CallAttempt;
use crate::error::Result;
use crate::io_plan::{IoParameter, IoPlan};
use crate::runtime::{AttachedDisk, RuntimeParameters};

/// Sub-codes reported alongside backend error codes.
pub mod sub_codes {
    /// Files could not be copied onto or off the VM.
    pub const STAGING_FAILURE: i32 = 5;
    /// The VM stopped without the backend knowing why.
    pub const UNEXPECTED_TERMINATION: i32 = 13;
    /// The VM was reclaimed by the cloud provider.
    pub const PREEMPTED: i32 = 14;
}

/// Opaque identifier of a submitted run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunHandle(String);

impl RunHandle {
    /// Wraps a backend run identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The backend run identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Not an error.
    Ok,
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The request was invalid.
    InvalidArgument,
    /// The deadline expired.
    DeadlineExceeded,
    /// An entity was not found.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The caller lacks permission.
    PermissionDenied,
    /// A resource was exhausted.
    ResourceExhausted,
    /// The system was not in the required state.
    FailedPrecondition,
    /// The operation was aborted.
    Aborted,
    /// A value was out of range.
    OutOfRange,
    /// The operation is not implemented.
    Unimplemented,
    /// Internal backend error.
    Internal,
    /// The service is unavailable.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// The caller is not authenticated.
    Unauthenticated,
}

impl ErrorCode {
    const ALL: [Self; 17] = [
        Self::Ok,
        Self::Cancelled,
        Self::Unknown,
        Self::InvalidArgument,
        Self::DeadlineExceeded,
        Self::NotFound,
        Self::AlreadyExists,
        Self::PermissionDenied,
        Self::ResourceExhausted,
        Self::FailedPrecondition,
        Self::Aborted,
        Self::OutOfRange,
        Self::Unimplemented,
        Self::Internal,
        Self::Unavailable,
        Self::DataLoss,
        Self::Unauthenticated,
    ];

    /// Maps a numeric code; unrecognized values are `Unknown`.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(Self::Unknown)
    }

    /// The numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Upper-case name used in messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// One entry of a run's event timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    /// What happened.
    pub description: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(description: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            description: description.into(),
            timestamp,
        }
    }
}

/// The VM a run executed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    /// Machine type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    /// Zone the VM ran in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// VM instance name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

/// Status of a submitted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Not finished yet.
    Running,
    /// Finished successfully.
    Success {
        /// Event timeline.
        events: Vec<ExecutionEvent>,
        /// VM the run executed on.
        machine: MachineInfo,
    },
    /// The VM was preempted.
    Preempted {
        /// Backend error code.
        error_code: ErrorCode,
        /// Backend sub-code.
        sub_code: Option<i32>,
        /// Backend message.
        message: String,
    },
    /// The run was cancelled.
    Cancelled,
    /// Finished unsuccessfully for another reason.
    UnsuccessfulOther {
        /// Backend error code.
        error_code: ErrorCode,
        /// Backend sub-code.
        sub_code: Option<i32>,
        /// Backend message.
        message: String,
        /// Return code of the command, if it ran.
        return_code: Option<i32>,
    },
}

impl RunStatus {
    /// Returns true for every status but `Running`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Lower-case label for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success { .. } => "success",
            Self::Preempted { .. } => "preempted",
            Self::Cancelled => "cancelled",
            Self::UnsuccessfulOther { .. } => "unsuccessful",
        }
    }
}

/// Description of one VM run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Attempt the run belongs to.
    pub attempt: CallAttempt,
    /// Container image running the command.
    pub docker_image: String,
    /// Command line executed in the container.
    pub command: String,
    /// CPU count.
    pub cpu: u32,
    /// Memory in MB.
    pub memory_mb: u64,
    /// Whether to request a preemptible VM.
    pub preemptible: bool,
    /// Attached disks.
    pub disks: Vec<AttachedDisk>,
    /// Boot disk size in GB.
    pub boot_disk_size_gb: u32,
    /// Zones the VM may run in.
    #[serde(default)]
    pub zones: Vec<String>,
    /// Service account the VM runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// Project billed for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_project: Option<String>,
    /// Parameters copied onto the VM.
    pub inputs: Vec<IoParameter>,
    /// Parameters copied off the VM.
    pub outputs: Vec<IoParameter>,
    /// Labels attached to the run.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl RunRequest {
    /// Builds a request from runtime parameters and an I/O plan.
    ///
    /// `preemptible` is decided by the caller from the retry counters.
    #[must_use]
    pub fn new(
        attempt: &CallAttempt,
        runtime: &RuntimeParameters,
        plan: &IoPlan,
        command: impl Into<String>,
        preemptible: bool,
    ) -> Self {
        let labels = BTreeMap::from([
            ("workflow-id".to_string(), attempt.workflow_id.to_string()),
            ("call".to_string(), label_value(&attempt.call)),
            ("shard".to_string(), attempt.shard_label()),
            ("attempt".to_string(), attempt.attempt.to_string()),
        ]);

        Self {
            attempt: attempt.clone(),
            docker_image: runtime.docker_image.clone(),
            command: command.into(),
            cpu: runtime.cpu,
            memory_mb: runtime.memory_mb(),
            preemptible,
            disks: runtime.disks.clone(),
            boot_disk_size_gb: runtime.boot_disk_size_gb,
            zones: runtime.zones.clone(),
            service_account: runtime.service_account.clone(),
            billing_project: runtime.billing_project.clone(),
            inputs: plan.all_inputs().cloned().collect(),
            outputs: plan.all_outputs().cloned().collect(),
            labels,
        }
    }
}

/// Lower-cases and replaces characters not allowed in label values.
fn label_value(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(63)
        .collect()
}

/// Client for the remote batch-compute API.
#[async_trait]
pub trait ComputeClient: Send + Sync + 'static {
    /// Submits a run and returns its handle.
    async fn submit(&self, request: &RunRequest) -> Result<RunHandle>;

    /// Fetches the current status of a run.
    async fn status(&self, handle: &RunHandle) -> Result<RunStatus>;

    /// Requests cancellation of a run. Cancellation is asynchronous.
    async fn abort(&self, handle: &RunHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_numbers() {
        assert_eq!(ErrorCode::from_code(5), ErrorCode::NotFound);
        assert_eq!(ErrorCode::from_code(10), ErrorCode::Aborted);
        assert_eq!(ErrorCode::from_code(16), ErrorCode::Unauthenticated);
        assert_eq!(ErrorCode::from_code(99), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_code(-1), ErrorCode::Unknown);
        assert_eq!(ErrorCode::Aborted.code(), 10);
        assert_eq!(ErrorCode::Aborted.to_string(), "ABORTED (10)");
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(
            RunStatus::Preempted {
                error_code: ErrorCode::Aborted,
                sub_code: Some(sub_codes::PREEMPTED),
                message: "preempted".into(),
            }
            .is_terminal()
        );
    }

    #[test]
    fn label_values_are_sanitized() {
        assert_eq!(label_value("Main.Align_Reads"), "main-align_reads");
        assert_eq!(label_value(&"x".repeat(100)).len(), 63);
    }

    #[test]
    fn run_handle_serializes_as_string() {
        let handle = RunHandle::new("operations/123");
        let json = serde_json::to_string(&handle).unwrap_or_default();
        assert_eq!(json, r#""operations/123""#);
    }
}
