//! Error types for the Nectar engine

use thiserror::Error;

/// Main error type for Nectar engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad or missing input, rejected before a session is created
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation on a torrent key that is not registered, or a
    /// confirmation issued outside the metadata-ready state
    #[error("Torrent not found: {0}")]
    NotFound(String),

    /// Torrent key is not a valid 64-character hex identifier
    #[error("Invalid torrent key: {0}")]
    InvalidKey(String),

    /// No peer connected within the bounded initial wait
    #[error("No peers found: {0}")]
    PeerTimeout(String),

    /// Stream failure mid-copy, not caused by cancellation
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Cooperative cancellation observed at a checkpoint
    #[error("Operation cancelled")]
    Cancelled,

    /// Content store adapter failure
    #[error("Store error: {0}")]
    Store(String),

    /// Discovery/transport adapter failure
    #[error("Swarm error: {0}")]
    Swarm(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error is a cooperative cancellation rather than a fault.
    ///
    /// Cancellation is a normal termination path and is never recorded in a
    /// session's `error` field.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias using EngineError
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::NotFound("abc123".to_string());
        assert_eq!(format!("{}", err), "Torrent not found: abc123");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_cancellation_is_not_a_fault() {
        assert!(EngineError::Cancelled.is_cancellation());
        assert!(!EngineError::Transfer("broken pipe".to_string()).is_cancellation());
    }
}
