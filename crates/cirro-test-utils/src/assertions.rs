//! Custom assertion helpers for integration tests.

use cirro_flow::job::{AttemptOutcome, FailureKind};
use cirro_flow::io_plan::MappedOutput;
use cirro_flow::ledger::RetryCounters;

/// Asserts that an attempt succeeded and returns its mapped outputs.
///
/// # Panics
///
/// Panics if the attempt did not succeed.
pub fn assert_succeeded(outcome: &AttemptOutcome) -> &[MappedOutput] {
    match outcome {
        AttemptOutcome::Succeeded { outputs, .. } => outputs,
        other => panic!("Expected attempt to succeed, but outcome was {other:?}"),
    }
}

/// Asserts that an attempt failed retryably with `kind` and returns the
/// counters written for the next attempt.
///
/// # Panics
///
/// Panics if the attempt did not fail retryably with `kind`.
pub fn assert_retryable(outcome: &AttemptOutcome, kind: FailureKind) -> RetryCounters {
    match outcome {
        AttemptOutcome::RetryableFailed {
            kind: actual,
            counters,
            ..
        } => {
            assert_eq!(
                *actual, kind,
                "Expected retryable {kind:?} failure, got {actual:?}: {}",
                outcome.reason()
            );
            *counters
        }
        other => panic!("Expected retryable {kind:?} failure, but outcome was {other:?}"),
    }
}

/// Asserts that an attempt failed fatally with `kind` and returns the reason.
///
/// # Panics
///
/// Panics if the attempt did not fail fatally with `kind`.
pub fn assert_fatal(outcome: &AttemptOutcome, kind: FailureKind) -> &str {
    match outcome {
        AttemptOutcome::FatalFailed {
            kind: actual,
            reason,
            ..
        } => {
            assert_eq!(
                *actual, kind,
                "Expected fatal {kind:?} failure, got {actual:?}: {reason}"
            );
            reason
        }
        other => panic!("Expected fatal {kind:?} failure, but outcome was {other:?}"),
    }
}

/// Asserts that an attempt was aborted.
///
/// # Panics
///
/// Panics if the attempt was not aborted.
pub fn assert_aborted(outcome: &AttemptOutcome) {
    assert!(
        matches!(outcome, AttemptOutcome::Aborted { .. }),
        "Expected attempt to be aborted, but outcome was {outcome:?}"
    );
}
