//! Error types for the call-attempt orchestration domain.

/// The result type used throughout cirro-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a call attempt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Runtime declarations could not be turned into runtime parameters.
    #[error("invalid runtime parameters: {message}")]
    InvalidRuntimeParameters {
        /// Description of the invalid declaration.
        message: String,
    },

    /// File references could not be planned into backend parameters.
    #[error("I/O planning failed: {message}")]
    Planning {
        /// Description of the planning failure.
        message: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A request to the compute API could not be completed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
        /// Whether repeating the request may succeed.
        retryable: bool,
    },

    /// The compute API rejected a request.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the rejection.
        message: String,
    },

    /// Configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from cirro-core.
    #[error("core error: {0}")]
    Core(#[from] cirro_core::error::Error),
}

impl Error {
    /// Creates a new invalid runtime parameters error.
    #[must_use]
    pub fn invalid_runtime(message: impl Into<String>) -> Self {
        Self::InvalidRuntimeParameters {
            message: message.into(),
        }
    }

    /// Creates a new planning error.
    #[must_use]
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    /// Creates a transport error that may succeed on retry.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a new backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the failed operation may succeed when repeated.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Core(cirro_core::Error::Storage { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "SUCCEEDED".into(),
            to: "ABORTED".into(),
            reason: "attempt already reached a terminal state".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SUCCEEDED"));
        assert!(msg.contains("ABORTED"));
        assert!(msg.contains("terminal"));
    }

    #[test]
    fn transient_classification() {
        assert!(Error::transient("connection reset").is_transient());
        assert!(
            !Error::Transport {
                message: "permission denied".into(),
                retryable: false,
            }
            .is_transient()
        );
        assert!(!Error::backend("invalid request").is_transient());
        assert!(Error::from(cirro_core::Error::storage("timeout")).is_transient());
        assert!(!Error::from(cirro_core::Error::NotFound("x".into())).is_transient());
    }
}
