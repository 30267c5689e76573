//! Error types for the assist runtime.

use std::time::Duration;

use crate::resilience::ledger::RecoveryStrategy;
use crate::worker::task::TaskId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure raised by a unit of work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// Worth retrying (timeouts, flaky dependencies).
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }

    pub fn transient(message: impl std::fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(format!("JSON error: {e}"))
    }
}

/// Errors surfaced by the task runtime API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {id} did not finish within {timeout:?}")]
    Timeout { id: TaskId, timeout: Duration },

    #[error("Task {id} failed: {reason}")]
    TaskFailed { id: TaskId, reason: String },

    /// Not a failure: callers should not alert on it.
    #[error("Task {id} was cancelled")]
    Cancelled { id: TaskId },

    #[error("Task runtime is shut down")]
    ShutDown,
}

/// Outcome of a call routed through a failure isolator.
#[derive(Debug, thiserror::Error)]
pub enum IsolatorError<E> {
    /// Fast-fail: the wrapped operation was not invoked.
    #[error("Isolator for {operation} is open, retry in {retry_in:?}")]
    Open { operation: String, retry_in: Duration },

    #[error(transparent)]
    Inner(E),
}

impl<E> IsolatorError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Unwrap the underlying failure, if the operation actually ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

/// Result delivery failures. Never surfaced to task owners.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection for {identity} is closed")]
    ConnectionClosed { identity: String },

    #[error("Delivery to {identity} timed out after {timeout:?}")]
    Timeout { identity: String, timeout: Duration },

    #[error("Failed to encode delivery: {0}")]
    Serialization(String),
}

/// Operation dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Operation {name} not found")]
    UnknownOperation { name: String },

    /// The operation's isolator is open; callers may fall back.
    #[error("Operation {name} unavailable, retry in {retry_in:?}")]
    Unavailable { name: String, retry_in: Duration },

    /// Retries are spent. `strategy` is the ledger's suggestion for this
    /// kind of failure, if past retries give one.
    #[error("Operation {name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: TaskError,
        strategy: Option<RecoveryStrategy>,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Stable short name for an error, used to group ledger records.
pub trait Classify: std::fmt::Display {
    fn kind(&self) -> &'static str;
}

impl Classify for TaskError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Failed(_) => "task_failure",
            Self::Panicked(_) => "panic",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Classify for RuntimeError {
    fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Timeout { .. } => "timeout",
            Self::TaskFailed { .. } => "task_failure",
            Self::Cancelled { .. } => "cancelled",
            Self::ShutDown => "shut_down",
        }
    }
}

impl<E: Classify> Classify for IsolatorError<E> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "isolator_open",
            Self::Inner(e) => e.kind(),
        }
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolator_error_kinds() {
        let open: IsolatorError<TaskError> = IsolatorError::Open {
            operation: "shell".into(),
            retry_in: Duration::from_secs(3),
        };
        assert!(open.is_open());
        assert_eq!(open.kind(), "isolator_open");
        assert!(open.into_inner().is_none());

        let inner = IsolatorError::Inner(TaskError::transient("timeout"));
        assert_eq!(inner.kind(), "transient");
        assert_eq!(inner.to_string(), "Transient failure: timeout");
    }

    #[test]
    fn task_error_helpers() {
        assert!(TaskError::transient("x").is_transient());
        assert!(!TaskError::failed("x").is_transient());
        assert_eq!(TaskError::failed("boom").to_string(), "boom");
    }
}
