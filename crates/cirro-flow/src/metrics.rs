//! Observability metrics for call-attempt orchestration.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `cirro_flow_attempt_transitions_total` | Counter | `from_state`, `to_state` | Attempt state transitions |
//! | `cirro_flow_polls_total` | Counter | `result` | Status polls by result |
//! | `cirro_flow_attempt_outcomes_total` | Counter | `outcome` | Terminal attempt outcomes |
//! | `cirro_flow_retries_total` | Counter | `reason` | Retryable failures by reason |
//! | `cirro_flow_transient_failures_total` | Counter | `operation` | Transient transport failures retried locally |
//! | `cirro_flow_ledger_write_failures_total` | Counter | - | Retry counter writes that failed |
//! | `cirro_flow_attempt_duration_seconds` | Histogram | `outcome` | Attempt wall-clock duration |
//!
//! Metrics are exposed via the `metrics` crate facade; installing an
//! exporter is left to the embedding process.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: attempt state transitions.
    pub const ATTEMPT_TRANSITIONS_TOTAL: &str = "cirro_flow_attempt_transitions_total";
    /// Counter: status polls.
    pub const POLLS_TOTAL: &str = "cirro_flow_polls_total";
    /// Counter: terminal attempt outcomes.
    pub const ATTEMPT_OUTCOMES_TOTAL: &str = "cirro_flow_attempt_outcomes_total";
    /// Counter: retryable failures.
    pub const RETRIES_TOTAL: &str = "cirro_flow_retries_total";
    /// Counter: transient transport failures retried locally.
    pub const TRANSIENT_FAILURES_TOTAL: &str = "cirro_flow_transient_failures_total";
    /// Counter: failed retry counter writes.
    pub const LEDGER_WRITE_FAILURES_TOTAL: &str = "cirro_flow_ledger_write_failures_total";
    /// Histogram: attempt duration in seconds.
    pub const ATTEMPT_DURATION_SECONDS: &str = "cirro_flow_attempt_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous attempt state.
    pub const FROM_STATE: &str = "from_state";
    /// Target attempt state.
    pub const TO_STATE: &str = "to_state";
    /// Poll result (running, terminal, error).
    pub const RESULT: &str = "result";
    /// Attempt outcome (succeeded, retryable_failed, fatal_failed, aborted).
    pub const OUTCOME: &str = "outcome";
    /// Retry reason (preempted, unexpected_termination).
    pub const REASON: &str = "reason";
    /// Operation (submit, poll, abort).
    pub const OPERATION: &str = "operation";
}

/// High-level interface for recording orchestration metrics.
///
/// Cheap to clone and share across attempts.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records an attempt state transition.
    pub fn record_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::ATTEMPT_TRANSITIONS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records one status poll.
    pub fn record_poll(&self, result: &str) {
        counter!(names::POLLS_TOTAL, labels::RESULT => result.to_string()).increment(1);
    }

    /// Records a terminal outcome and the attempt's duration.
    pub fn record_outcome(&self, outcome: &str, duration: Duration) {
        counter!(
            names::ATTEMPT_OUTCOMES_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        histogram!(
            names::ATTEMPT_DURATION_SECONDS,
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a retryable failure.
    pub fn record_retry(&self, reason: &str) {
        counter!(names::RETRIES_TOTAL, labels::REASON => reason.to_string()).increment(1);
    }

    /// Records a transient failure that will be retried locally.
    pub fn record_transient_failure(&self, operation: &str) {
        counter!(
            names::TRANSIENT_FAILURES_TOTAL,
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    /// Records a failed retry counter write.
    pub fn record_ledger_write_failure(&self) {
        counter!(names::LEDGER_WRITE_FAILURES_TOTAL).increment(1);
    }
}

/// Measures the wall-clock duration of an attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptTimer {
    start: Instant,
}

impl AttemptTimer {
    /// Starts timing.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_metrics_record_without_recorder() {
        let metrics = FlowMetrics::new();

        metrics.record_transition("NOT_STARTED", "SUBMITTING");
        metrics.record_poll("running");
        metrics.record_outcome("succeeded", Duration::from_secs(42));
        metrics.record_retry("preempted");
        metrics.record_transient_failure("submit");
        metrics.record_ledger_write_failure();
    }

    #[test]
    fn attempt_timer_measures_elapsed() {
        let timer = AttemptTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
