//! Error types for scanlogin

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for scanlogin operations
///
/// Cloneable so a single failure can be delivered both to an outstanding
/// login and to whoever triggered it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON serialization error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Polling gave up after {retries} retries, refresh the code and try again")]
    PollExhausted { retries: u32 },

    #[error("No correlation id became available within {0:?}")]
    CorrelationIdTimeout(Duration),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Instance destroyed")]
    InstanceDestroyed,

    #[error("A login is already in progress")]
    AlreadyInProgress,

    #[error("Failed to load provider script: {0}")]
    ScriptLoad(String),

    #[error("Failed to render login code: {0}")]
    Render(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Result type alias using scanlogin's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// Whether the poll loop should swallow this error and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Protocol(_) | Error::Json(_)
        )
    }

    /// Whether this error ends a run silently instead of settling it.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::InstanceDestroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transport("HTTP 502").is_retryable());
        assert!(Error::protocol("missing data").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::PollExhausted { retries: 13 }.is_retryable());
        assert!(!Error::LoginFailed("denied".into()).is_retryable());
        assert!(!Error::InstanceDestroyed.is_retryable());
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::InstanceDestroyed.is_cancellation());
        assert!(!Error::transport("reset").is_cancellation());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::PollExhausted { retries: 13 }.to_string(),
            "Polling gave up after 13 retries, refresh the code and try again"
        );
        assert_eq!(Error::InstanceDestroyed.to_string(), "Instance destroyed");
    }
}
