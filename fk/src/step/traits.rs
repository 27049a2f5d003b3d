//! Step executor trait definition

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::StepError;
use crate::context::ExecutionContext;
use crate::domain::Step;

/// Outcome of one step execution
#[derive(Debug, Clone)]
pub struct StepResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
}

impl StepResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// A worker for one step type
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Step type this executor handles; doubles as a slave capability string
    fn type_name(&self) -> &'static str;

    /// One-time setup before any step runs
    async fn init(&self) -> Result<(), StepError> {
        Ok(())
    }

    /// Run the step's type-specific logic
    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError>;

    /// Release resources at shutdown
    async fn cleanup(&self) -> Result<(), StepError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_result_constructors() {
        let ok = StepResult::success(serde_json::json!({"status": 200}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let bad = StepResult::failure("exit code 1");
        assert!(!bad.success);
        assert_eq!(bad.error.as_deref(), Some("exit code 1"));
    }
}
