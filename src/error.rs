//! Error types for backend-wire.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all backend protocol operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// I/O error during pipe or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No progress on any backend descriptor within the configured timeout.
    #[error("Timeout waiting for backend after {0:?}")]
    Timeout(Duration),

    /// Backend closed its data descriptor without sending a Terminate frame.
    #[error("Backend closed the connection")]
    ConnectionClosed,

    /// Operation attempted on a link with no live backend.
    #[error("Backend connection is closed")]
    Closed,

    /// Backend executable could not be started.
    #[error("Cannot execute backend {command}: {source}")]
    Spawn {
        /// Path of the executable.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Malformed 8-byte frame header.
    #[error("Invalid frame header: {0}")]
    InvalidHeader(String),

    /// Payload exceeds the six-digit length field.
    #[error("Payload size {0} exceeds maximum 999999")]
    PayloadTooLarge(usize),

    /// Frame or command outside the vocabulary expected in the current state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend sent an Error (`E`) or Fatal (`A`) frame.
    #[error("Backend error: {message}")]
    Reported {
        /// Message text sent by the backend.
        message: String,
        /// True for `A` frames.
        fatal: bool,
    },

    /// Malformed restore overlay, plugin command or item metadata.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BackendError {
    /// Whether this error always aborts the backend session.
    ///
    /// Only a non-fatal reported error (`E` frame) and configuration errors
    /// may be recovered above this crate.
    pub fn is_fatal(&self) -> bool {
        match self {
            BackendError::Reported { fatal, .. } => *fatal,
            BackendError::Config(_) => false,
            _ => true,
        }
    }
}

/// Result type alias using BackendError.
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BackendError::ConnectionClosed.is_fatal());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(BackendError::Protocol("x".into()).is_fatal());
        assert!(!BackendError::Reported {
            message: "x".into(),
            fatal: false
        }
        .is_fatal());
        assert!(BackendError::Reported {
            message: "x".into(),
            fatal: true
        }
        .is_fatal());
    }

    #[test]
    fn test_display() {
        let err = BackendError::PayloadTooLarge(1_000_000);
        assert_eq!(err.to_string(), "Payload size 1000000 exceeds maximum 999999");
    }
}
