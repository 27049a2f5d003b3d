//! Flowkit - workflow model and keyword execution pipeline
//!
//! Flowkit is everything a single node needs to run a declarative workflow
//! locally: the workflow data model, the keyword registry, the per-step
//! execution context, the pre/main/post processor pipeline, and the
//! type-dispatched step executors (HTTP, script, wait, db_query).
//!
//! The distributed engine (`loadflow`) builds on this crate: a master
//! partitions a workflow's load into segments and slaves drive this
//! pipeline for their assigned share.

pub mod context;
pub mod domain;
pub mod keyword;
pub mod pipeline;
pub mod step;

// Re-export commonly used types
pub use context::{ExecutionContext, RequestRecord, ResponseData};
pub use domain::{
    DurationHistogram, ExecutionMode, ExecutionOptions, ExecutionSegment, ExecutionState, ExecutionStatus,
    FailurePolicy, MetricsReport, OutputConfig, Processor, ResourceCaps, SlaveInfo, SlaveState, SlaveStatus,
    SlaveType, Stage, Step, StepMetrics, SystemMetrics, TaskResult, TaskStatus, TaskUpdate, Threshold,
    ThresholdOp, ValidationError, Workflow,
};
pub use keyword::{Category, Keyword, KeywordError, KeywordRegistry, KeywordResult, Params};
pub use pipeline::{ActionRecord, IterationOutcome, OutcomeStatus, Phase, StepOutcome, StepPipeline};
pub use step::{StepError, StepExecutor, StepExecutors, StepResult};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
