//! Global error types and error handling utilities

use serde::Serialize;

/// Main error type covering every failure the pipeline can surface.
///
/// Variants are a taxonomy, not free text: callers branch on the kind to
/// decide whether a failure is reported to the client, retried at the next
/// tick, or absorbed with a degraded result.
#[derive(Debug, thiserror::Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum Error {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("Buffer overflow: Session exceeds maximum size")]
    BufferOverflow,

    #[error("Operation '{operation}' is not valid while session is {state}")]
    BadState { operation: String, state: String },

    #[error("Stitch failed: {message}")]
    Stitch { message: String },

    #[error("Transcription failed: {message}")]
    Transcribe { message: String },

    #[error("Summarization failed: {message}")]
    Summarize { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl Error {
    /// Create a new session-not-found error
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Create a new bad-state error
    pub fn bad_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::BadState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a new stitch error
    pub fn stitch(message: impl Into<String>) -> Self {
        Self::Stitch {
            message: message.into(),
        }
    }

    /// Create a new transcription error
    pub fn transcribe(message: impl Into<String>) -> Self {
        Self::Transcribe {
            message: message.into(),
        }
    }

    /// Create a new summarization error
    pub fn summarize(message: impl Into<String>) -> Self {
        Self::Summarize {
            message: message.into(),
        }
    }

    /// Create a new IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether a retry at the next scheduler tick can succeed.
    ///
    /// Permanent kinds (unknown session, illegal transition, overflow) are
    /// reported to the originator and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Stitch { .. } | Self::Transcribe { .. } | Self::Io { .. } | Self::Database { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Convert from sqlx::Error
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            message: err.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_message_is_client_contract() {
        // The exact text is part of the wire contract for overflow rejections.
        assert_eq!(
            Error::BufferOverflow.to_string(),
            "Buffer overflow: Session exceeds maximum size"
        );
    }

    #[test]
    fn test_not_found_names_the_session() {
        let err = Error::not_found("sess-1");
        assert_eq!(err.to_string(), "Session not found: sess-1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::stitch("all strategies exhausted").is_transient());
        assert!(Error::transcribe("timed out").is_transient());
        assert!(!Error::BufferOverflow.is_transient());
        assert!(!Error::bad_state("pause", "completed").is_transient());
        assert!(!Error::not_found("x").is_transient());
    }
}
