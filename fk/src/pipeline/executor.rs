//! StepPipeline - drives pre → main → post for each step
//!
//! Contracts: actions run in declared order, the first failure in any
//! phase stops the step (a pre failure prevents the main action and all
//! post actions), every attempted action is recorded, and cancellation
//! yields an aborted outcome rather than a failure.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::record::{ActionRecord, OutcomeStatus, Phase, StepOutcome};
use crate::context::ExecutionContext;
use crate::domain::{FailurePolicy, Processor, Step, Workflow};
use crate::keyword::{KeywordRegistry, Params};
use crate::step::{StepError, StepExecutors};

/// Shared recorder so partial history survives a timeout drop
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<ActionRecord>>>);

impl Recorder {
    fn push(&self, record: ActionRecord) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    fn take(&self) -> Vec<ActionRecord> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Outcome of one whole workflow iteration
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub success: bool,
    pub aborted: bool,
    /// `(step id, outcome)` for every step that ran
    pub steps: Vec<(String, StepOutcome)>,
}

/// Runs steps through their keyword phases
///
/// The registry and executor set are injected; nothing here reaches for
/// process-wide defaults.
pub struct StepPipeline {
    registry: Arc<KeywordRegistry>,
    executors: Arc<StepExecutors>,
}

impl StepPipeline {
    pub fn new(registry: Arc<KeywordRegistry>, executors: Arc<StepExecutors>) -> Self {
        Self { registry, executors }
    }

    pub fn registry(&self) -> &Arc<KeywordRegistry> {
        &self.registry
    }

    pub fn executors(&self) -> &Arc<StepExecutors> {
        &self.executors
    }

    /// Run one step: pre-processors, the step action, post-processors
    pub async fn run_step(&self, step: &Step, ctx: &ExecutionContext, cancel: &CancellationToken) -> StepOutcome {
        let recorder = Recorder::default();
        let step_cancel = cancel.child_token();
        let started = Instant::now();

        let result = match step.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    self.run_phases(step, ctx, &step_cancel, &recorder),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        step_cancel.cancel();
                        (OutcomeStatus::Failed, Some(format!("timed out after {ms}ms")))
                    }
                }
            }
            None => self.run_phases(step, ctx, &step_cancel, &recorder).await,
        };

        let (status, error) = result;
        StepOutcome {
            status,
            records: recorder.take(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_phases(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        recorder: &Recorder,
    ) -> (OutcomeStatus, Option<String>) {
        if let Some(outcome) = self.run_processors(&step.pre_processors, Phase::Pre, ctx, cancel, recorder).await {
            return outcome;
        }

        if cancel.is_cancelled() {
            return (OutcomeStatus::Aborted, None);
        }

        // main action
        let started = Instant::now();
        let main_result = self.executors.execute(step, ctx, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match main_result {
            Ok(result) => {
                recorder.push(ActionRecord {
                    keyword: step.step_type.clone(),
                    order: 0,
                    phase: Phase::Main,
                    success: result.success,
                    error: result.error.clone(),
                    duration_ms,
                });
                if !result.success {
                    return (OutcomeStatus::Failed, result.error);
                }
            }
            Err(StepError::Cancelled) => {
                recorder.push(ActionRecord {
                    keyword: step.step_type.clone(),
                    order: 0,
                    phase: Phase::Main,
                    success: false,
                    error: Some("cancelled".to_string()),
                    duration_ms,
                });
                return (OutcomeStatus::Aborted, None);
            }
            Err(e) => {
                let message = e.to_string();
                recorder.push(ActionRecord {
                    keyword: step.step_type.clone(),
                    order: 0,
                    phase: Phase::Main,
                    success: false,
                    error: Some(message.clone()),
                    duration_ms,
                });
                return (OutcomeStatus::Failed, Some(message));
            }
        }

        if let Some(outcome) = self
            .run_processors(&step.post_processors, Phase::Post, ctx, cancel, recorder)
            .await
        {
            return outcome;
        }

        (OutcomeStatus::Success, None)
    }

    /// Run one processor list; `Some` short-circuits the step
    async fn run_processors(
        &self,
        processors: &[Processor],
        phase: Phase,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
        recorder: &Recorder,
    ) -> Option<(OutcomeStatus, Option<String>)> {
        for (order, processor) in processors.iter().enumerate() {
            if cancel.is_cancelled() {
                return Some((OutcomeStatus::Aborted, None));
            }
            let record = self.run_action(processor, order, phase, ctx, cancel).await;
            let failed = !record.success;
            let error = record.error.clone();
            recorder.push(record);
            if failed {
                if cancel.is_cancelled() {
                    return Some((OutcomeStatus::Aborted, None));
                }
                return Some((OutcomeStatus::Failed, error));
            }
        }
        None
    }

    /// Resolve, validate, and execute one keyword
    async fn run_action(
        &self,
        processor: &Processor,
        order: usize,
        phase: Phase,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> ActionRecord {
        let started = Instant::now();
        let mut record = ActionRecord {
            keyword: processor.keyword.clone(),
            order,
            phase,
            success: false,
            error: None,
            duration_ms: 0,
        };

        let keyword = match self.registry.get(&processor.keyword) {
            Ok(kw) => kw,
            Err(e) => {
                record.error = Some(e.to_string());
                record.duration_ms = started.elapsed().as_millis() as u64;
                return record;
            }
        };

        // interpolate parameter leaves before validation
        let params = match Params::from_value(&ctx.interpolate_value(&processor.params)) {
            Ok(p) => p,
            Err(e) => {
                record.error = Some(e.to_string());
                record.duration_ms = started.elapsed().as_millis() as u64;
                return record;
            }
        };

        if let Err(e) = keyword.validate(&params) {
            record.error = Some(e.to_string());
            record.duration_ms = started.elapsed().as_millis() as u64;
            return record;
        }

        let result = keyword.execute(ctx, &params, cancel).await;
        debug!(keyword = %processor.keyword, %phase, success = result.success, "action finished");
        record.success = result.success;
        record.error = result.error;
        record.duration_ms = started.elapsed().as_millis() as u64;
        record
    }

    /// Run all steps of one workflow iteration in declared order
    ///
    /// A failed step stops the iteration unless its `on_failure` policy is
    /// `continue`; an aborted step always stops it.
    pub async fn run_iteration(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> IterationOutcome {
        let mut steps = Vec::with_capacity(workflow.steps.len());
        let mut success = true;
        let mut aborted = false;

        for step in &workflow.steps {
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }
            let outcome = self.run_step(step, ctx, cancel).await;
            let status = outcome.status;
            steps.push((step.id.clone(), outcome));
            match status {
                OutcomeStatus::Success => {}
                OutcomeStatus::Aborted => {
                    aborted = true;
                    break;
                }
                OutcomeStatus::Failed => {
                    success = false;
                    if step.on_failure == FailurePolicy::Stop {
                        break;
                    }
                }
            }
        }

        IterationOutcome {
            success: success && !aborted,
            aborted,
            steps,
        }
    }
}
