//! Error types and result aliases for cirro.
//!
//! This module defines the shared error types used by storage backends and
//! the storage location resolver. Errors are structured for programmatic
//! handling and include context for debugging.

/// The result type used throughout cirro-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cirro core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage location string could not be turned into a remote location.
    #[error("invalid storage location '{location}': {reason}")]
    InvalidLocation {
        /// The offending location string.
        location: String,
        /// Why the location was rejected.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invalid location error.
    #[must_use]
    pub fn invalid_location(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn invalid_location_display_names_the_location() {
        let err = Error::invalid_location("s3://bucket/key", "scheme 's3' is not 'gs'");
        let msg = err.to_string();
        assert!(msg.contains("s3://bucket/key"));
        assert!(msg.contains("scheme"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded");
        let err = Error::storage_with_source("failed to read object", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
