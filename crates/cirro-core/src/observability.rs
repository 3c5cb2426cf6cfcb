//! Observability infrastructure for cirro.
//!
//! Structured logging with consistent spans. This module provides the
//! subscriber initialization helper and the span constructor used by every
//! call attempt so log lines can be correlated across submit, poll and
//! terminal handling.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `cirro_flow=debug`)
///
/// # Example
///
/// ```rust
/// use cirro_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one call attempt.
///
/// `job_tag` is the `workflow:call:shard:attempt` rendering of the attempt.
///
/// # Example
///
/// ```rust
/// use cirro_core::observability::attempt_span;
///
/// let span = attempt_span("submit", "2b1f...:wf.align:3:1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn attempt_span(operation: &str, job_tag: &str) -> Span {
    tracing::info_span!("attempt", op = operation, job = job_tag)
}

/// Creates a span for storage location resolution.
#[must_use]
pub fn storage_span(operation: &str, bucket: &str) -> Span {
    tracing::debug_span!("storage", op = operation, bucket = bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn attempt_span_can_be_entered() {
        let span = attempt_span("poll", "wf:call:-1:1");
        let _guard = span.enter();
        tracing::info!("message in attempt span");
    }

    #[test]
    fn storage_span_can_be_entered() {
        let span = storage_span("resolve", "my-bucket");
        let _guard = span.enter();
        tracing::debug!("message in storage span");
    }
}
