//! Keyword trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::KeywordError;
use super::params::Params;
use crate::context::ExecutionContext;

/// Functional category of a keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Assertion,
    Extractor,
    Action,
    Control,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assertion => write!(f, "assertion"),
            Self::Extractor => write!(f, "extractor"),
            Self::Action => write!(f, "action"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// Outcome of one keyword execution
#[derive(Debug, Clone)]
pub struct KeywordResult {
    pub success: bool,
    pub message: String,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl KeywordResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    pub fn pass_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            error: Some(message.clone()),
            message,
            data: None,
        }
    }
}

/// A named, validated, executable primitive
///
/// `validate` checks the parameter shape before `execute` runs; `execute`
/// is a blocking (from the caller's view) async call that must honour the
/// cancellation token at its suspension points.
#[async_trait]
pub trait Keyword: Send + Sync {
    fn name(&self) -> &'static str;

    fn category(&self) -> Category;

    fn description(&self) -> &'static str;

    fn validate(&self, params: &Params) -> Result<(), KeywordError>;

    async fn execute(&self, ctx: &ExecutionContext, params: &Params, cancel: &CancellationToken) -> KeywordResult;
}
