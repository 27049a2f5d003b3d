//! StepExecutors - type-keyed dispatch over the executor set

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::db::DbQueryExecutor;
use super::error::StepError;
use super::http::HttpExecutor;
use super::script::ScriptExecutor;
use super::traits::{StepExecutor, StepResult};
use super::wait::WaitExecutor;
use crate::context::ExecutionContext;
use crate::domain::Step;

/// Dispatches steps to the executor registered for their type
pub struct StepExecutors {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepExecutors {
    /// Executor set with all standard step types
    pub fn standard() -> Self {
        let mut executors: HashMap<String, Arc<dyn StepExecutor>> = HashMap::new();
        for exec in [
            Arc::new(HttpExecutor::new()) as Arc<dyn StepExecutor>,
            Arc::new(ScriptExecutor),
            Arc::new(WaitExecutor),
            Arc::new(DbQueryExecutor),
        ] {
            executors.insert(exec.type_name().to_string(), exec);
        }
        Self { executors }
    }

    /// Empty set (for testing)
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.type_name().to_string(), executor);
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Supported step types; these double as slave capability strings
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a step with the executor for its type
    pub async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        let executor = self
            .executors
            .get(&step.step_type)
            .ok_or_else(|| StepError::UnknownStepType {
                name: step.step_type.clone(),
            })?;
        debug!(step_id = %step.id, step_type = %step.step_type, "executing step");
        executor.execute(step, ctx, cancel).await
    }

    pub async fn init_all(&self) -> Result<(), StepError> {
        for exec in self.executors.values() {
            exec.init().await?;
        }
        Ok(())
    }

    pub async fn cleanup_all(&self) -> Result<(), StepError> {
        for exec in self.executors.values() {
            exec.cleanup().await?;
        }
        Ok(())
    }
}

impl Default for StepExecutors {
    fn default() -> Self {
        Self::standard()
    }
}
