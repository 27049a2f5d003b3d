//! Keyword error types

use thiserror::Error;

/// Errors from keyword registration, lookup, and validation
#[derive(Debug, Error)]
pub enum KeywordError {
    #[error("keyword not found: {name}")]
    NotFound { name: String },

    #[error("keyword already registered: {name}")]
    AlreadyRegistered { name: String },

    #[error("keyword name is empty")]
    EmptyName,

    #[error("invalid params: {key}: {reason}")]
    InvalidParams { key: String, reason: String },

    #[error("keyword execution failed: {0}")]
    ExecutionFailed(String),
}

impl KeywordError {
    /// Shorthand for the common invalid-parameter case
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
