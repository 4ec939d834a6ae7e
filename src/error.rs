//! Error Types
//!
//! Error taxonomy for transport failures, task outcomes and operation misuse.

use thiserror::Error;

use crate::operation::OperationState;
use crate::transport::TaskId;

/// Errors reported by a transport, surfaced verbatim through task completion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("Too many redirects ({0})")]
    TooManyRedirects(usize),

    #[error("Session invalidated")]
    SessionInvalidated,

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the transport reported this failure because the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else if err.is_builder() {
            TransportError::UnsupportedUrl(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// Outcome error delivered to a task's completion callback.
///
/// Cancellation is its own variant so callers can tell "user cancelled"
/// apart from "network failed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TaskError {
    /// Classify a transport completion error for an operation.
    ///
    /// Any error on a cancelled operation, and the transport's own cancellation
    /// error, become [`TaskError::Cancelled`].
    pub fn from_completion(error: Option<TransportError>, cancelled: bool) -> Option<Self> {
        match error {
            Some(_) if cancelled => Some(TaskError::Cancelled),
            Some(TransportError::Cancelled) => Some(TaskError::Cancelled),
            Some(err) => Some(TaskError::Transport(err)),
            None if cancelled => Some(TaskError::Cancelled),
            None => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Authentication(_)))
    }
}

/// Errors raised synchronously by operation construction and control
#[derive(Error, Debug)]
pub enum OperationError {
    #[error("Transport rejected the request: {0}")]
    Construction(#[source] TransportError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Task {0} is already owned by another operation")]
    DuplicateTask(TaskId),

    #[error("Session has been invalidated")]
    SessionInvalidated,

    #[error("Cannot {action} an operation that is {state}")]
    InvalidTransition {
        state: OperationState,
        action: &'static str,
    },

    #[error("Operation was cancelled before it started")]
    CancelledBeforeStart,

    #[error("Operation belongs to an execution queue and is started by it")]
    Queued,
}

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid certificate fingerprint: {0}")]
    InvalidFingerprint(String),
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for operation construction and control
pub type OperationResult<T> = Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_classification() {
        assert_eq!(
            TaskError::from_completion(Some(TransportError::Cancelled), false),
            Some(TaskError::Cancelled)
        );
        assert_eq!(
            TaskError::from_completion(Some(TransportError::Timeout), true),
            Some(TaskError::Cancelled)
        );
        assert_eq!(TaskError::from_completion(None, true), Some(TaskError::Cancelled));
        assert_eq!(TaskError::from_completion(None, false), None);
    }

    #[test]
    fn test_transport_errors_pass_through() {
        let err = TaskError::from_completion(Some(TransportError::Timeout), false).unwrap();
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());

        let auth = TaskError::from(TransportError::Authentication("denied".into()));
        assert!(auth.is_authentication());
        assert_eq!(auth.to_string(), "Authentication failed: denied");
    }
}
