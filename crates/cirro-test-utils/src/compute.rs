//! Scripted compute client.
//!
//! Submit and status responses are queued up front; every call is recorded
//! in order so tests can assert on what the attempt asked for.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use cirro_flow::compute::{ComputeClient, ErrorCode, RunHandle, RunRequest, RunStatus, sub_codes};
use cirro_flow::error::{Error, Result};

/// Record of a compute call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeCall {
    /// A run was submitted.
    Submit(Box<RunRequest>),
    /// A run's status was fetched.
    Status(RunHandle),
    /// A run was asked to abort.
    Abort(RunHandle),
}

/// Compute client that replays queued responses.
///
/// - Submits without a queued response return `operations/<n>`.
/// - Status calls without a queued response return `Cancelled` once an
///   abort was requested, and a backend error otherwise so a test that runs
///   out of script fails instead of polling forever.
#[derive(Debug, Default)]
pub struct ScriptedComputeClient {
    submits: Mutex<VecDeque<Result<RunHandle>>>,
    statuses: Mutex<VecDeque<Result<RunStatus>>>,
    calls: Mutex<Vec<ComputeCall>>,
    submitted: AtomicUsize,
    aborted: AtomicBool,
}

impl ScriptedComputeClient {
    /// Creates a client with nothing queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a submit response.
    pub fn push_submit(&self, response: Result<RunHandle>) {
        self.submits.lock().expect("lock").push_back(response);
    }

    /// Queues a status response.
    pub fn push_status(&self, response: Result<RunStatus>) {
        self.statuses.lock().expect("lock").push_back(response);
    }

    /// Queues several successful status responses.
    pub fn push_statuses(&self, statuses: impl IntoIterator<Item = RunStatus>) {
        self.statuses
            .lock()
            .expect("lock")
            .extend(statuses.into_iter().map(Ok));
    }

    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<ComputeCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Returns every submitted request.
    #[must_use]
    pub fn submitted_requests(&self) -> Vec<RunRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ComputeCall::Submit(request) => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// Returns the handles abort was requested for.
    #[must_use]
    pub fn abort_requests(&self) -> Vec<RunHandle> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ComputeCall::Abort(handle) => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Number of status calls made.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ComputeCall::Status(_)))
            .count()
    }

    fn record(&self, call: ComputeCall) {
        self.calls.lock().expect("lock").push(call);
    }
}

#[async_trait]
impl ComputeClient for ScriptedComputeClient {
    async fn submit(&self, request: &RunRequest) -> Result<RunHandle> {
        self.record(ComputeCall::Submit(Box::new(request.clone())));
        let queued = self.submits.lock().expect("lock").pop_front();
        queued.unwrap_or_else(|| {
            let n = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RunHandle::new(format!("operations/{n}")))
        })
    }

    async fn status(&self, handle: &RunHandle) -> Result<RunStatus> {
        self.record(ComputeCall::Status(handle.clone()));
        let queued = self.statuses.lock().expect("lock").pop_front();
        queued.unwrap_or_else(|| {
            if self.aborted.load(Ordering::SeqCst) {
                Ok(RunStatus::Cancelled)
            } else {
                Err(Error::backend(format!("no scripted status left for {handle}")))
            }
        })
    }

    async fn abort(&self, handle: &RunHandle) -> Result<()> {
        self.record(ComputeCall::Abort(handle.clone()));
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A preemption status as the backend reports it.
#[must_use]
pub fn preempted_status() -> RunStatus {
    RunStatus::Preempted {
        error_code: ErrorCode::Aborted,
        sub_code: Some(sub_codes::PREEMPTED),
        message: format!("{}: The assigned worker has failed to complete the operation", sub_codes::PREEMPTED),
    }
}

/// An unexpected-termination status.
#[must_use]
pub fn unexpected_termination_status() -> RunStatus {
    RunStatus::UnsuccessfulOther {
        error_code: ErrorCode::Aborted,
        sub_code: Some(sub_codes::UNEXPECTED_TERMINATION),
        message: format!("{}: VM stopped unexpectedly", sub_codes::UNEXPECTED_TERMINATION),
        return_code: None,
    }
}

/// A localization or delocalization failure status.
#[must_use]
pub fn staging_failure_status() -> RunStatus {
    RunStatus::UnsuccessfulOther {
        error_code: ErrorCode::FailedPrecondition,
        sub_code: Some(sub_codes::STAGING_FAILURE),
        message: format!("{}: Execution failed: copying gs://bucket/in.txt", sub_codes::STAGING_FAILURE),
        return_code: None,
    }
}
