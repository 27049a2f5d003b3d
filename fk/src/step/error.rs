//! Step executor error types

use thiserror::Error;

/// Errors raised by step executors
///
/// Failures of the system under test (non-2xx responses, failed
/// assertions) are not errors; they surface through `StepResult` and the
/// post-processors. These variants cover executor-level problems.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid step config: {reason}")]
    InvalidConfig { reason: String },

    #[error("unknown step type: {name}")]
    UnknownStepType { name: String },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {ms}ms")]
    TimedOut { ms: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl StepError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }
}
