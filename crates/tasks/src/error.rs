//! Task-level error type.

use thiserror::Error;

/// Errors returned by a task's `run` method.
///
/// The pipeline uses the variant to decide retry behaviour:
/// - `Retryable` — the task is re-invoked in place with exponential back-off,
///   up to the configured limit.
/// - `Fatal`     — the launch is immediately fizzled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure; the pipeline may re-invoke the task.
    #[error("retryable task error: {0}")]
    Retryable(String),

    /// Permanent failure; the remaining tasks of the launch are skipped.
    #[error("fatal task error: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// The bare message, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::Fatal(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("invalid task parameters: {err}"))
    }
}
