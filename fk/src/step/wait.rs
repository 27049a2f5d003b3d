//! Wait step executor

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::error::StepError;
use super::traits::{StepExecutor, StepResult};
use crate::context::ExecutionContext;
use crate::domain::Step;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WaitConfig {
    duration_ms: u64,
}

/// Executor for `wait` steps; blocks until the duration elapses or
/// cancellation fires
pub struct WaitExecutor;

#[async_trait]
impl StepExecutor for WaitExecutor {
    fn type_name(&self) -> &'static str {
        "wait"
    }

    async fn execute(
        &self,
        step: &Step,
        _ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let config: WaitConfig = serde_json::from_value(step.config.clone())
            .map_err(|e| StepError::invalid_config(e.to_string()))?;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(config.duration_ms)) => {
                Ok(StepResult::success(serde_json::json!({"waited-ms": config.duration_ms})))
            }
            () = cancel.cancelled() => Err(StepError::Cancelled),
        }
    }
}
