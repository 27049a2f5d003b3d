//! Domain types for workflows, tasks, slaves, metrics, and executions

mod execution;
mod metrics;
mod options;
mod segment;
mod slave;
mod task;
mod workflow;

pub use execution::{ExecutionState, ExecutionStatus};
pub use metrics::{DurationHistogram, MetricsReport, StepMetrics, SystemMetrics};
pub use options::{ExecutionMode, ExecutionOptions, Stage};
pub use segment::ExecutionSegment;
pub use slave::{ResourceCaps, SlaveInfo, SlaveState, SlaveStatus, SlaveType};
pub use task::{TaskResult, TaskStatus, TaskUpdate};
pub use workflow::{Processor, Step, FailurePolicy, Threshold, ThresholdOp, ValidationError, Workflow, OutputConfig};
