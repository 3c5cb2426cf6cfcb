//! Job attempt lifecycle.
//!
//! A [`JobAttempt`] drives one call attempt against the compute backend:
//!
//! ```text
//! NotStarted ─► Submitting ─► Pending ─► Polling ─┬─► Succeeded
//!     │              │           ▲                ├─► RetryableFailed
//!     └── reconnect ─┼───────────┘                ├─► FatalFailed
//!                    └────────────────────────────┴─► Aborted
//! ```
//!
//! The attempt never resubmits. A [`AttemptOutcome::RetryableFailed`]
//! tells the supervisor to start `attempt + 1`; the retry counters it needs
//! have already been written to the ledger.
//!
//! Aborts arrive through a [`CancellationToken`]. Before a run handle
//! exists an abort ends the attempt without contacting the compute API.
//! Afterwards one abort request is sent and polling continues until the
//! backend reports a terminal status.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cirro_core::location::{LocationResolver, StorageLocation};
use cirro_core::observability::attempt_span;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::attempt::CallAttempt;
use crate::backoff::Backoff;
use crate::compute::{
    ComputeClient, ErrorCode, ExecutionEvent, MachineInfo, RunHandle, RunRequest, RunStatus,
    sub_codes,
};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::io_plan::{
    InputDeclaration, IoPlan, IoPlanner, MappedOutput, OutputDeclaration, PlanContext, detritus,
};
use crate::ledger::{RetryCounters, RetryLedger};
use crate::metrics::{AttemptTimer, FlowMetrics};
use crate::runtime::RuntimeParameters;

/// Unexpected terminations retried before the call fails.
pub const MAX_UNEXPECTED_RETRIES: u32 = 2;

const SCRIPT_CONTENT_TYPE: &str = "text/x-shellscript";

/// Lifecycle state of a call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Created, nothing done yet.
    #[default]
    NotStarted,
    /// Preparing and submitting the run.
    Submitting,
    /// Run handle known, no status observed yet.
    Pending,
    /// Run observed executing.
    Polling,
    /// Run succeeded and outputs were mapped.
    Succeeded,
    /// Failed; a new attempt should be started.
    RetryableFailed,
    /// Failed; the call fails.
    FatalFailed,
    /// Aborted on request.
    Aborted,
}

impl AttemptState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::RetryableFailed | Self::FatalFailed | Self::Aborted
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::NotStarted => matches!(
                target,
                Self::Submitting | Self::Pending | Self::FatalFailed | Self::Aborted
            ),
            Self::Submitting => {
                matches!(target, Self::Pending | Self::FatalFailed | Self::Aborted)
            }
            Self::Pending => matches!(
                target,
                Self::Polling
                    | Self::Succeeded
                    | Self::RetryableFailed
                    | Self::FatalFailed
                    | Self::Aborted
            ),
            Self::Polling => matches!(
                target,
                Self::Succeeded | Self::RetryableFailed | Self::FatalFailed | Self::Aborted
            ),
            Self::Succeeded | Self::RetryableFailed | Self::FatalFailed | Self::Aborted => false,
        }
    }

    /// Returns all valid target states from the current state.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::NotStarted => vec![
                Self::Submitting,
                Self::Pending,
                Self::FatalFailed,
                Self::Aborted,
            ],
            Self::Submitting => vec![Self::Pending, Self::FatalFailed, Self::Aborted],
            Self::Pending => vec![
                Self::Polling,
                Self::Succeeded,
                Self::RetryableFailed,
                Self::FatalFailed,
                Self::Aborted,
            ],
            Self::Polling => vec![
                Self::Succeeded,
                Self::RetryableFailed,
                Self::FatalFailed,
                Self::Aborted,
            ],
            Self::Succeeded | Self::RetryableFailed | Self::FatalFailed | Self::Aborted => vec![],
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Submitting => "submitting",
            Self::Pending => "pending",
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::RetryableFailed => "retryable_failed",
            Self::FatalFailed => "fatal_failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NOT_STARTED"),
            Self::Submitting => write!(f, "SUBMITTING"),
            Self::Pending => write!(f, "PENDING"),
            Self::Polling => write!(f, "POLLING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::RetryableFailed => write!(f, "RETRYABLE_FAILED"),
            Self::FatalFailed => write!(f, "FATAL_FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Validated state holder for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptLifecycle {
    tag: String,
    state: AttemptState,
    metrics: FlowMetrics,
}

impl AttemptLifecycle {
    /// Creates a lifecycle in [`AttemptState::NotStarted`].
    #[must_use]
    pub fn new(attempt: &CallAttempt) -> Self {
        Self {
            tag: attempt.tag(),
            state: AttemptState::NotStarted,
            metrics: FlowMetrics::new(),
        }
    }

    /// The current state.
    #[must_use]
    pub const fn state(&self) -> AttemptState {
        self.state
    }

    /// Transitions to a new state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn transition_to(&mut self, target: AttemptState, reason: &str) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.state,
                    self.state.valid_transitions()
                ),
            });
        }

        tracing::info!(
            attempt = %self.tag,
            from = %self.state,
            to = %target,
            reason,
            "attempt state transition"
        );
        self.metrics
            .record_transition(self.state.as_label(), target.as_label());
        self.state = target;
        Ok(())
    }

    /// Moves to a terminal state exactly once.
    ///
    /// Returns `Ok(false)` if the attempt is already in `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not terminal, or the attempt already
    /// reached a different terminal state.
    pub fn try_terminal(&mut self, target: AttemptState, reason: &str) -> Result<bool> {
        if !target.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "try_terminal requires a terminal state".to_string(),
            });
        }
        if self.state.is_terminal() {
            if self.state == target {
                return Ok(false);
            }
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "attempt already reached a terminal state".to_string(),
            });
        }
        self.transition_to(target, reason)?;
        Ok(true)
    }
}

/// Classification of an unsuccessful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Declarations, paths or the I/O plan were invalid.
    Validation,
    /// The compute or storage API kept failing transiently.
    TransientTransport,
    /// Files could not be copied onto or off the VM.
    Staging,
    /// The VM stopped without the backend knowing why.
    UnexpectedTermination,
    /// The VM was preempted.
    Preemption,
    /// The command exited with a return code not declared as success.
    ReturnCode,
    /// Declared outputs could not be mapped to remote files.
    OutputMapping,
    /// Any other backend failure.
    Unclassified,
}

impl FailureKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TransientTransport => "transient_transport",
            Self::Staging => "staging",
            Self::UnexpectedTermination => "unexpected_termination",
            Self::Preemption => "preempted",
            Self::ReturnCode => "return_code",
            Self::OutputMapping => "output_mapping",
            Self::Unclassified => "unclassified",
        }
    }

    fn of(error: &Error) -> Self {
        if error.is_transient() {
            return Self::TransientTransport;
        }
        match error {
            Error::InvalidRuntimeParameters { .. }
            | Error::Planning { .. }
            | Error::Configuration { .. }
            | Error::Core(
                cirro_core::Error::InvalidLocation { .. } | cirro_core::Error::InvalidInput(_),
            ) => Self::Validation,
            _ => Self::Unclassified,
        }
    }
}

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The run succeeded.
    Succeeded {
        /// Run that produced the outputs.
        handle: RunHandle,
        /// Return code of the command.
        return_code: i32,
        /// Remote values of every declared output.
        outputs: Vec<MappedOutput>,
        /// Event timeline of the run.
        events: Vec<ExecutionEvent>,
        /// VM the run executed on.
        machine: MachineInfo,
    },
    /// The call should be retried with the next attempt.
    RetryableFailed {
        /// Run that failed.
        handle: RunHandle,
        /// Why the attempt failed.
        kind: FailureKind,
        /// Message for the user.
        reason: String,
        /// Counters written for the next attempt.
        counters: RetryCounters,
    },
    /// The call fails.
    FatalFailed {
        /// Run that failed, if one was submitted.
        handle: Option<RunHandle>,
        /// Why the attempt failed.
        kind: FailureKind,
        /// Message for the user.
        reason: String,
        /// Return code of the command, if known.
        return_code: Option<i32>,
    },
    /// The attempt was aborted.
    Aborted {
        /// Run that was aborted, if one was submitted.
        handle: Option<RunHandle>,
    },
}

impl AttemptOutcome {
    /// Terminal state matching this outcome.
    #[must_use]
    pub const fn state(&self) -> AttemptState {
        match self {
            Self::Succeeded { .. } => AttemptState::Succeeded,
            Self::RetryableFailed { .. } => AttemptState::RetryableFailed,
            Self::FatalFailed { .. } => AttemptState::FatalFailed,
            Self::Aborted { .. } => AttemptState::Aborted,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        self.state().as_label()
    }

    /// The run handle, if a run was submitted or reconnected to.
    #[must_use]
    pub const fn handle(&self) -> Option<&RunHandle> {
        match self {
            Self::Succeeded { handle, .. } | Self::RetryableFailed { handle, .. } => Some(handle),
            Self::FatalFailed { handle, .. } | Self::Aborted { handle } => handle.as_ref(),
        }
    }

    /// Message describing the outcome.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Succeeded { .. } => "run succeeded",
            Self::RetryableFailed { reason, .. } | Self::FatalFailed { reason, .. } => {
                reason.as_str()
            }
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Everything the workflow evaluator supplies for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescription {
    /// Attempt identity.
    pub attempt: CallAttempt,
    /// `gs://` root for this attempt's outputs and logs.
    pub call_root: String,
    /// Evaluated runtime declarations.
    #[serde(default)]
    pub runtime: BTreeMap<String, Value>,
    /// Input file values.
    #[serde(default)]
    pub inputs: Vec<InputDeclaration>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputDeclaration>,
    /// Rendered command script.
    pub script: String,
}

/// Re-attachment to a run submitted before a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconnect {
    /// Recorded run handle.
    pub handle: RunHandle,
    /// Whether to abort the run before polling it.
    #[serde(default)]
    pub force_abort: bool,
}

impl Reconnect {
    /// Reconnects and keeps the run going.
    #[must_use]
    pub const fn resume(handle: RunHandle) -> Self {
        Self {
            handle,
            force_abort: false,
        }
    }

    /// Reconnects and aborts the run.
    #[must_use]
    pub const fn abort(handle: RunHandle) -> Self {
        Self {
            handle,
            force_abort: true,
        }
    }
}

/// Collaborators shared by every attempt against one backend.
#[derive(Clone)]
pub struct AttemptBackend {
    compute: Arc<dyn ComputeClient>,
    ledger: RetryLedger,
    planner: IoPlanner,
    config: Arc<BackendConfig>,
}

impl fmt::Debug for AttemptBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptBackend")
            .field("compute", &"<ComputeClient>")
            .field("ledger", &self.ledger)
            .field("planner", &self.planner)
            .field("config", &self.config)
            .finish()
    }
}

impl AttemptBackend {
    /// Creates the shared collaborators.
    #[must_use]
    pub fn new(
        compute: Arc<dyn ComputeClient>,
        ledger: RetryLedger,
        resolver: Arc<LocationResolver>,
        config: BackendConfig,
    ) -> Self {
        let planner = IoPlanner::new(resolver).with_log_upload_cadence(config.log_upload_cadence);
        Self {
            compute,
            ledger,
            planner,
            config: Arc::new(config),
        }
    }

    /// The backend configuration.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The I/O planner.
    #[must_use]
    pub const fn planner(&self) -> &IoPlanner {
        &self.planner
    }
}

/// Per-attempt values computed before submission or reconnection.
struct Prepared {
    runtime: RuntimeParameters,
    call_root: StorageLocation,
    monitoring_script: Option<StorageLocation>,
    counters: RetryCounters,
    plan: IoPlan,
}

impl Prepared {
    fn context(&self) -> PlanContext<'_> {
        PlanContext {
            call_root: &self.call_root,
            disks: &self.runtime.disks,
            monitoring_script: self.monitoring_script.as_ref(),
        }
    }

    fn stderr(&self) -> String {
        self.call_root.resolve(detritus::STDERR).uri()
    }
}

/// Where the attempt is when a transient failure needs a pause.
#[derive(Debug, Clone, Copy)]
enum Phase<'h> {
    /// No run exists; an abort ends the attempt.
    BeforeHandle,
    /// A run exists; an abort is forwarded to the backend.
    Running(&'h RunHandle),
    /// The run finished; aborts no longer matter.
    Finished,
}

enum StepError {
    Aborted,
    Failed(Error),
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// One call attempt.
pub struct JobAttempt {
    description: JobDescription,
    backend: AttemptBackend,
    lifecycle: AttemptLifecycle,
    cancel: CancellationToken,
    abort_requested: AtomicBool,
    run_handle: watch::Sender<Option<RunHandle>>,
    metrics: FlowMetrics,
}

impl fmt::Debug for JobAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobAttempt")
            .field("attempt", &self.description.attempt)
            .field("state", &self.lifecycle.state())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobAttempt {
    /// Creates an attempt that has not started yet.
    #[must_use]
    pub fn new(description: JobDescription, backend: AttemptBackend) -> Self {
        let (run_handle, _) = watch::channel(None);
        Self {
            lifecycle: AttemptLifecycle::new(&description.attempt),
            description,
            backend,
            cancel: CancellationToken::new(),
            abort_requested: AtomicBool::new(false),
            run_handle,
            metrics: FlowMetrics::new(),
        }
    }

    /// Token that aborts this attempt when cancelled.
    #[must_use]
    pub fn abort_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receiver that sees the run handle once it is known.
    #[must_use]
    pub fn run_handle_receiver(&self) -> watch::Receiver<Option<RunHandle>> {
        self.run_handle.subscribe()
    }

    /// Runs the attempt on its own task.
    #[must_use]
    pub fn spawn(self, reconnect: Option<Reconnect>) -> AttemptHandle {
        let cancel = self.abort_token();
        let run_handle = self.run_handle_receiver();
        let task = tokio::spawn(self.run(reconnect));
        AttemptHandle {
            cancel,
            run_handle,
            task,
        }
    }

    /// Runs the attempt to a terminal outcome.
    ///
    /// With `reconnect`, the recorded run is polled instead of submitting a
    /// new one.
    pub async fn run(mut self, reconnect: Option<Reconnect>) -> AttemptOutcome {
        let timer = AttemptTimer::start();
        let tag = self.description.attempt.tag();
        let operation = if reconnect.is_some() { "reconnect" } else { "submit" };

        let outcome = self
            .drive(reconnect)
            .instrument(attempt_span(operation, &tag))
            .await;

        self.metrics.record_outcome(outcome.as_label(), timer.elapsed());
        if let AttemptOutcome::RetryableFailed { kind, .. } = &outcome {
            self.metrics.record_retry(kind.as_label());
        }
        tracing::info!(
            attempt = %tag,
            outcome = outcome.as_label(),
            reason = outcome.reason(),
            "attempt finished"
        );
        outcome
    }

    async fn drive(&mut self, reconnect: Option<Reconnect>) -> AttemptOutcome {
        let mut poll_backoff = self.backend.config.poll_backoff.start();
        let mut recover_backoff = self.backend.config.submit_backoff.start();

        let started = match reconnect {
            Some(reconnect) => self.reconnect(reconnect, &mut recover_backoff).await,
            None => self.submit(&mut recover_backoff).await,
        };
        let (handle, prepared) = match started {
            ControlFlow::Continue(started) => started,
            ControlFlow::Break(outcome) => return self.finish(outcome),
        };

        let outcome = self
            .poll(&handle, &prepared, &mut poll_backoff, &mut recover_backoff)
            .await;
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: AttemptOutcome) -> AttemptOutcome {
        if let Err(e) = self.lifecycle.try_terminal(outcome.state(), outcome.reason()) {
            tracing::error!(error = %e, "terminal transition rejected");
        }
        outcome
    }

    fn advance(&mut self, target: AttemptState, reason: &str) {
        if let Err(e) = self.lifecycle.transition_to(target, reason) {
            tracing::error!(error = %e, "state transition rejected");
        }
    }

    fn fatal(
        handle: Option<&RunHandle>,
        kind: FailureKind,
        reason: String,
        return_code: Option<i32>,
    ) -> AttemptOutcome {
        AttemptOutcome::FatalFailed {
            handle: handle.cloned(),
            kind,
            reason,
            return_code,
        }
    }

    fn failure(&self, handle: Option<&RunHandle>, error: &Error, context: &str) -> AttemptOutcome {
        Self::fatal(
            handle,
            FailureKind::of(error),
            format!("Task {} {context}: {error}", self.description.attempt.tag()),
            None,
        )
    }

    async fn prepare(&self) -> Result<Prepared> {
        let config = &self.backend.config;
        let runtime =
            RuntimeParameters::from_declarations(&self.description.runtime, &config.runtime_defaults)?;
        let resolver = self.backend.planner.resolver();
        let call_root = resolver.build(&self.description.call_root).await?;
        let monitoring_script = match &config.monitoring_script {
            Some(raw) => Some(resolver.build(raw).await?),
            None => None,
        };
        let counters = self.backend.ledger.read(&self.description.attempt).await;

        Ok(Prepared {
            runtime,
            call_root,
            monitoring_script,
            counters,
            plan: IoPlan::default(),
        })
    }

    fn command(runtime: &RuntimeParameters) -> String {
        let mount = runtime
            .working_disk()
            .map_or("", |disk| disk.mount_point.trim_end_matches('/'));
        format!("/bin/bash {mount}/{}", detritus::SCRIPT_FILE)
    }

    async fn submit(
        &mut self,
        recover: &mut Backoff,
    ) -> ControlFlow<AttemptOutcome, (RunHandle, Prepared)> {
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
        }
        self.advance(AttemptState::Submitting, "starting submission");

        let prepared = self
            .with_transient_retry("prepare", recover, Phase::BeforeHandle, || self.prepare())
            .await;
        let mut prepared = match prepared {
            Ok(prepared) => prepared,
            Err(StepError::Aborted) => {
                return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
            }
            Err(StepError::Failed(e)) => {
                return ControlFlow::Break(self.failure(None, &e, "could not be prepared"));
            }
        };
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
        }

        let script = prepared.call_root.resolve(detritus::SCRIPT_FILE);
        let uploaded = {
            let script = &script;
            let body = Bytes::from(self.description.script.clone());
            self.with_transient_retry("upload_script", recover, Phase::BeforeHandle, move || {
                let body = body.clone();
                async move {
                    script
                        .write(body, Some(SCRIPT_CONTENT_TYPE))
                        .await
                        .map_err(Error::from)
                }
            })
            .await
        };
        match uploaded {
            Ok(()) => tracing::debug!(script = %script, "uploaded command script"),
            Err(StepError::Aborted) => {
                return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
            }
            Err(StepError::Failed(e)) => {
                return ControlFlow::Break(self.failure(
                    None,
                    &e,
                    &format!("could not upload its script to {script}"),
                ));
            }
        }

        let planned = {
            let planner = &self.backend.planner;
            let ctx = prepared.context();
            let inputs = self.description.inputs.as_slice();
            let outputs = self.description.outputs.as_slice();
            self.with_transient_retry("plan", recover, Phase::BeforeHandle, move || async move {
                planner.plan(&ctx, inputs, outputs).await
            })
            .await
        };
        match planned {
            Ok(plan) => prepared.plan = plan,
            Err(StepError::Aborted) => {
                return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
            }
            Err(StepError::Failed(e)) => {
                return ControlFlow::Break(self.failure(None, &e, "could not plan its inputs and outputs"));
            }
        }
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
        }

        let ceiling = prepared.runtime.preemptible;
        let preemptible = prepared.counters.preemption_count < ceiling;
        let request = RunRequest::new(
            &self.description.attempt,
            &prepared.runtime,
            &prepared.plan,
            Self::command(&prepared.runtime),
            preemptible,
        );
        tracing::info!(
            preemptible,
            preemption_count = prepared.counters.preemption_count,
            ceiling,
            inputs = request.inputs.len(),
            outputs = request.outputs.len(),
            "submitting run"
        );

        let submitted = {
            let compute = &self.backend.compute;
            let request = &request;
            self.with_transient_retry("submit", recover, Phase::BeforeHandle, move || {
                compute.submit(request)
            })
            .await
        };
        let handle = match submitted {
            Ok(handle) => handle,
            Err(StepError::Aborted) => {
                return ControlFlow::Break(AttemptOutcome::Aborted { handle: None });
            }
            Err(StepError::Failed(e)) => {
                return ControlFlow::Break(self.failure(None, &e, "could not be submitted"));
            }
        };

        self.run_handle.send_replace(Some(handle.clone()));
        self.advance(AttemptState::Pending, &format!("submitted as {handle}"));
        ControlFlow::Continue((handle, prepared))
    }

    /// Re-attaches to a recorded run. A forced abort is sent before anything
    /// local can fail, so the remote run is never left unattended.
    async fn reconnect(
        &mut self,
        reconnect: Reconnect,
        recover: &mut Backoff,
    ) -> ControlFlow<AttemptOutcome, (RunHandle, Prepared)> {
        let Reconnect {
            handle,
            force_abort,
        } = reconnect;

        self.run_handle.send_replace(Some(handle.clone()));
        if force_abort {
            self.request_abort(&handle).await;
        }

        let prepared = {
            let handle = &handle;
            self.with_transient_retry("prepare", recover, Phase::Running(handle), || self.prepare())
                .await
        };
        let mut prepared = match prepared {
            Ok(prepared) => prepared,
            Err(StepError::Aborted) => {
                return ControlFlow::Break(AttemptOutcome::Aborted {
                    handle: Some(handle),
                });
            }
            Err(StepError::Failed(e)) => {
                return ControlFlow::Break(self.failure(Some(&handle), &e, "could not be prepared"));
            }
        };
        let planned = self
            .backend
            .planner
            .plan_outputs(&prepared.context(), &self.description.outputs);
        match planned {
            Ok(plan) => prepared.plan = plan,
            Err(e) => {
                return ControlFlow::Break(self.failure(
                    Some(&handle),
                    &e,
                    "could not plan its outputs",
                ));
            }
        }

        self.advance(AttemptState::Pending, &format!("reconnected to {handle}"));
        ControlFlow::Continue((handle, prepared))
    }

    async fn request_abort(&self, handle: &RunHandle) {
        if self.abort_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(handle = %handle, "requesting abort");
        if let Err(e) = self.backend.compute.abort(handle).await {
            tracing::warn!(handle = %handle, error = %e, "abort request failed, polling continues");
        }
    }

    /// Sleeps for `wait`; returns false if the attempt was aborted meanwhile.
    async fn sleep_unless_aborted(&self, wait: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(wait) => true,
        }
    }

    /// Sleeps for `wait`, forwarding an abort to the backend if one arrives.
    async fn sleep_while_running(&self, wait: Duration, handle: &RunHandle) {
        if self.abort_requested.load(Ordering::SeqCst) {
            tokio::time::sleep(wait).await;
            return;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => self.request_abort(handle).await,
            () = tokio::time::sleep(wait) => {}
        }
    }

    async fn with_transient_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        backoff: &mut Backoff,
        phase: Phase<'_>,
        mut call: F,
    ) -> std::result::Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0_u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && failures < self.backend.config.max_transient_retries => {
                    failures += 1;
                    let wait = backoff.next_interval();
                    self.metrics.record_transient_failure(operation);
                    tracing::warn!(operation, error = %e, failures, retry_in = ?wait, "transient failure, retrying");

                    match phase {
                        Phase::BeforeHandle => {
                            if !self.sleep_unless_aborted(wait).await {
                                return Err(StepError::Aborted);
                            }
                        }
                        Phase::Running(handle) => self.sleep_while_running(wait, handle).await,
                        Phase::Finished => tokio::time::sleep(wait).await,
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(operation, error = %e, failures, "transient failures exhausted");
                    }
                    return Err(StepError::Failed(e));
                }
            }
        }
    }

    async fn poll(
        &mut self,
        handle: &RunHandle,
        prepared: &Prepared,
        poll: &mut Backoff,
        recover: &mut Backoff,
    ) -> AttemptOutcome {
        loop {
            self.sleep_while_running(poll.next_interval(), handle).await;

            let polled = {
                let compute = &self.backend.compute;
                self.with_transient_retry("poll", recover, Phase::Running(handle), move || {
                    compute.status(handle)
                })
                .await
            };
            let status = match polled {
                Ok(status) => status,
                Err(StepError::Aborted) => continue,
                Err(StepError::Failed(e)) => {
                    self.metrics.record_poll("error");
                    return self.failure(Some(handle), &e, "could not be polled");
                }
            };

            tracing::debug!(handle = %handle, status = status.as_label(), "polled run");
            if !status.is_terminal() {
                self.metrics.record_poll("running");
                if self.lifecycle.state() == AttemptState::Pending {
                    self.advance(AttemptState::Polling, "run is executing");
                }
                continue;
            }

            self.metrics.record_poll("terminal");
            return self.handle_terminal(handle, status, prepared, recover).await;
        }
    }

    #[tracing::instrument(skip_all, fields(handle = %handle, status = status.as_label()))]
    async fn handle_terminal(
        &self,
        handle: &RunHandle,
        status: RunStatus,
        prepared: &Prepared,
        recover: &mut Backoff,
    ) -> AttemptOutcome {
        match status {
            RunStatus::Success { events, machine } => {
                self.handle_success(handle, events, machine, prepared, recover)
                    .await
            }
            RunStatus::Cancelled => AttemptOutcome::Aborted {
                handle: Some(handle.clone()),
            },
            RunStatus::Preempted {
                error_code,
                sub_code,
                message,
            } => {
                let ceiling = prepared.runtime.preemptible;
                if prepared.runtime.preemptible_eligible()
                    && prepared.counters.preemption_count < ceiling
                {
                    self.preempted(handle, error_code, &message, prepared).await
                } else {
                    self.handle_unsuccessful(handle, error_code, sub_code, &message, None, prepared)
                        .await
                }
            }
            RunStatus::UnsuccessfulOther {
                error_code,
                sub_code,
                message,
                return_code,
            } => {
                self.handle_unsuccessful(handle, error_code, sub_code, &message, return_code, prepared)
                    .await
            }
            RunStatus::Running => Self::fatal(
                Some(handle),
                FailureKind::Unclassified,
                "run reported a non-terminal status as terminal".to_string(),
                None,
            ),
        }
    }

    async fn preempted(
        &self,
        handle: &RunHandle,
        error_code: ErrorCode,
        message: &str,
        prepared: &Prepared,
    ) -> AttemptOutcome {
        let attempt = &self.description.attempt;
        let ceiling = prepared.runtime.preemptible;
        let counters = prepared.counters.preempted();
        self.backend.ledger.write(&attempt.next(), counters).await;

        let next = if counters.preemption_count >= ceiling {
            format!(
                "The maximum preemptible attempts reached ({ceiling}); the next attempt runs non-preemptible."
            )
        } else {
            format!(
                "The call will be restarted with another preemptible VM (max preemptible attempts: {ceiling})."
            )
        };
        let reason = format!(
            "Task {} was preempted for the {} time. {next} Error code {error_code}. Message: {message}",
            attempt.tag(),
            ordinal(counters.preemption_count),
        );
        tracing::warn!(handle = %handle, ?counters, "{reason}");

        AttemptOutcome::RetryableFailed {
            handle: handle.clone(),
            kind: FailureKind::Preemption,
            reason,
            counters,
        }
    }

    async fn handle_unsuccessful(
        &self,
        handle: &RunHandle,
        error_code: ErrorCode,
        sub_code: Option<i32>,
        message: &str,
        return_code: Option<i32>,
        prepared: &Prepared,
    ) -> AttemptOutcome {
        let attempt = &self.description.attempt;
        let stderr = prepared.stderr();

        match (error_code, sub_code) {
            (_, Some(sub_codes::STAGING_FAILURE)) => Self::fatal(
                Some(handle),
                FailureKind::Staging,
                format!(
                    "Task {} failed to localize or delocalize files. Error code {error_code}. \
                     Message: {message}. Check {stderr} for details.",
                    attempt.tag()
                ),
                return_code,
            ),
            (ErrorCode::Aborted, Some(sub_codes::UNEXPECTED_TERMINATION)) => {
                let counters = prepared.counters.unexpectedly_terminated();
                self.backend.ledger.write(&attempt.next(), counters).await;

                let count = counters.unexpected_retry_count;
                if count <= MAX_UNEXPECTED_RETRIES {
                    let reason = format!(
                        "Task {} terminated unexpectedly for the {} time and will be retried. \
                         Error code {error_code}. Message: {message}",
                        attempt.tag(),
                        ordinal(count)
                    );
                    tracing::warn!(handle = %handle, ?counters, "{reason}");
                    AttemptOutcome::RetryableFailed {
                        handle: handle.clone(),
                        kind: FailureKind::UnexpectedTermination,
                        reason,
                        counters,
                    }
                } else {
                    Self::fatal(
                        Some(handle),
                        FailureKind::UnexpectedTermination,
                        format!(
                            "Task {} terminated unexpectedly {count} times, more than the \
                             {MAX_UNEXPECTED_RETRIES} retries allowed. Error code {error_code}. \
                             Message: {message}. Check {stderr} for details.",
                            attempt.tag()
                        ),
                        return_code,
                    )
                }
            }
            _ => {
                let rc = return_code
                    .map(|rc| format!(" Return code: {rc}."))
                    .unwrap_or_default();
                Self::fatal(
                    Some(handle),
                    FailureKind::Unclassified,
                    format!(
                        "Task {} failed. Error code {error_code}. Message: {message}.{rc} \
                         Check {stderr} for details.",
                        attempt.tag()
                    ),
                    return_code,
                )
            }
        }
    }

    async fn handle_success(
        &self,
        handle: &RunHandle,
        events: Vec<ExecutionEvent>,
        machine: MachineInfo,
        prepared: &Prepared,
        recover: &mut Backoff,
    ) -> AttemptOutcome {
        let tag = self.description.attempt.tag();
        let stderr = prepared.stderr();
        let rc_file = prepared.call_root.resolve(detritus::RETURN_CODE);

        let contents = {
            let rc_file = &rc_file;
            self.with_transient_retry("read_return_code", recover, Phase::Finished, move || async move {
                rc_file.read_to_string().await.map_err(Error::from)
            })
            .await
        };
        let contents = match contents {
            Ok(contents) => contents,
            Err(err) => {
                let detail = match err {
                    StepError::Failed(e) => e.to_string(),
                    StepError::Aborted => "aborted".to_string(),
                };
                return Self::fatal(
                    Some(handle),
                    FailureKind::Unclassified,
                    format!(
                        "Task {tag} could not read its return code from {rc_file}: {detail}. \
                         Check {stderr} for details."
                    ),
                    None,
                );
            }
        };
        let return_code = match contents.trim().parse::<i32>() {
            Ok(rc) => rc,
            Err(e) => {
                return Self::fatal(
                    Some(handle),
                    FailureKind::Unclassified,
                    format!(
                        "Task {tag} wrote an unreadable return code '{}' to {rc_file}: {e}",
                        contents.trim()
                    ),
                    None,
                );
            }
        };

        if !prepared.runtime.continue_on_return_code.allows(return_code) {
            return Self::fatal(
                Some(handle),
                FailureKind::ReturnCode,
                format!(
                    "Task {tag} exited with return code {return_code} which has not been declared \
                     as a valid return code. See 'continueOnReturnCode' runtime attribute for more \
                     details. Check {stderr} for details."
                ),
                Some(return_code),
            );
        }

        let mapped = self
            .backend
            .planner
            .map_outputs(&prepared.plan, &prepared.context(), &self.description.outputs)
            .await;
        let outputs = match mapped {
            Ok(outputs) => outputs,
            Err(e) => {
                return Self::fatal(
                    Some(handle),
                    FailureKind::OutputMapping,
                    format!("Task {tag} succeeded but its outputs could not be mapped: {e}"),
                    Some(return_code),
                );
            }
        };

        for event in &events {
            tracing::info!(
                handle = %handle,
                timestamp = %event.timestamp,
                description = %event.description,
                "execution event"
            );
        }

        AttemptOutcome::Succeeded {
            handle: handle.clone(),
            return_code,
            outputs,
            events,
            machine,
        }
    }
}

/// Handle to an attempt running on its own task.
#[derive(Debug)]
pub struct AttemptHandle {
    cancel: CancellationToken,
    run_handle: watch::Receiver<Option<RunHandle>>,
    task: JoinHandle<AttemptOutcome>,
}

impl AttemptHandle {
    /// Requests an abort of the attempt.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// The run handle, once the run was submitted or reconnected to.
    #[must_use]
    pub fn run_handle(&self) -> Option<RunHandle> {
        self.run_handle.borrow().clone()
    }

    /// Waits for the attempt's outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt task panicked or was cancelled.
    pub async fn outcome(self) -> Result<AttemptOutcome> {
        self.task
            .await
            .map_err(|e| Error::backend(format!("attempt task failed: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn lifecycle() -> AttemptLifecycle {
        AttemptLifecycle::new(&CallAttempt::new(Uuid::nil(), "wf.call"))
    }

    #[test]
    fn submission_path_transitions() {
        let mut lifecycle = lifecycle();
        lifecycle
            .transition_to(AttemptState::Submitting, "start")
            .unwrap();
        lifecycle.transition_to(AttemptState::Pending, "submitted").unwrap();
        lifecycle.transition_to(AttemptState::Polling, "running").unwrap();
        assert!(lifecycle.try_terminal(AttemptState::Succeeded, "done").unwrap());
        assert_eq!(lifecycle.state(), AttemptState::Succeeded);
    }

    #[test]
    fn reconnect_enters_pending_directly() {
        let mut lifecycle = lifecycle();
        lifecycle.transition_to(AttemptState::Pending, "reconnected").unwrap();
        assert!(
            lifecycle
                .try_terminal(AttemptState::RetryableFailed, "preempted")
                .unwrap()
        );
    }

    #[test]
    fn invalid_transition_lists_valid_targets() {
        let mut lifecycle = lifecycle();
        let err = lifecycle
            .transition_to(AttemptState::Polling, "skip ahead")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("NOT_STARTED"));
        assert!(message.contains("POLLING"));
        assert!(message.contains("Submitting"));
        assert_eq!(lifecycle.state(), AttemptState::NotStarted);
    }

    #[test]
    fn second_terminal_transition_is_rejected() {
        let mut lifecycle = lifecycle();
        lifecycle
            .transition_to(AttemptState::Submitting, "start")
            .unwrap();
        assert!(lifecycle.try_terminal(AttemptState::Aborted, "abort").unwrap());
        assert!(!lifecycle.try_terminal(AttemptState::Aborted, "abort").unwrap());
        assert!(
            lifecycle
                .try_terminal(AttemptState::FatalFailed, "late failure")
                .is_err()
        );
        assert!(
            lifecycle
                .try_terminal(AttemptState::Polling, "not terminal")
                .is_err()
        );
        assert_eq!(lifecycle.state(), AttemptState::Aborted);
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        for state in [
            AttemptState::Succeeded,
            AttemptState::RetryableFailed,
            AttemptState::FatalFailed,
            AttemptState::Aborted,
        ] {
            assert!(state.is_terminal());
            assert!(state.valid_transitions().is_empty());
        }
        for state in [
            AttemptState::NotStarted,
            AttemptState::Submitting,
            AttemptState::Pending,
            AttemptState::Polling,
        ] {
            for target in state.valid_transitions() {
                assert!(state.can_transition_to(target));
            }
        }
    }

    #[test]
    fn ordinals() {
        let rendered: Vec<String> = [1, 2, 3, 4, 11, 12, 13, 21, 22, 23, 101, 111]
            .into_iter()
            .map(ordinal)
            .collect();
        assert_eq!(
            rendered,
            vec![
                "1st", "2nd", "3rd", "4th", "11th", "12th", "13th", "21st", "22nd", "23rd",
                "101st", "111th"
            ]
        );
    }

    #[test]
    fn failure_kinds_follow_errors() {
        assert_eq!(
            FailureKind::of(&Error::transient("reset")),
            FailureKind::TransientTransport
        );
        assert_eq!(
            FailureKind::of(&Error::invalid_runtime("docker is required")),
            FailureKind::Validation
        );
        assert_eq!(
            FailureKind::of(&Error::backend("rejected")),
            FailureKind::Unclassified
        );
    }

    #[test]
    fn outcome_accessors() {
        let outcome = AttemptOutcome::Aborted {
            handle: Some(RunHandle::new("operations/1")),
        };
        assert_eq!(outcome.state(), AttemptState::Aborted);
        assert_eq!(outcome.as_label(), "aborted");
        assert_eq!(outcome.handle().map(RunHandle::as_str), Some("operations/1"));
    }
}
