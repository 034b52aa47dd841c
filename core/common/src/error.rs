//! Common error types for scoresync.

use thiserror::Error;

/// Top-level error type for scoresync operations.
///
/// Storage and validation errors are reported to the caller immediately.
/// Network, timeout and conflict errors are absorbed by the action and
/// conflict state machines and surface through the status subscription.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable medium unavailable or full.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed or rule-breaking mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Version divergence with the remote authority.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A bounded operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation was cancelled before completing.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Whether the error is worth retrying with backoff.
    ///
    /// Timeouts are treated exactly like network failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::Timeout("submit".to_string()).is_transient());
        assert!(!Error::Conflict("stale".to_string()).is_transient());
        assert!(!Error::Validation("bad".to_string()).is_transient());
        assert!(!Error::Storage("full".to_string()).is_transient());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
