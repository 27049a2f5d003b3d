//! Workflow, Step, and Processor definitions
//!
//! A workflow is immutable once accepted: validation and defaulting happen
//! at submission and nothing mutates it during execution.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::options::ExecutionOptions;

/// Validation failures surfaced at workflow submission
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow id is empty")]
    EmptyWorkflowId,

    #[error("workflow has no steps")]
    NoSteps,

    #[error("duplicate step id: {id}")]
    DuplicateStepId { id: String },

    #[error("step {step_id} has empty id or type")]
    EmptyStepField { step_id: String },

    #[error("unknown step type '{step_type}' in step {step_id}")]
    UnknownStepType { step_id: String, step_type: String },

    #[error("unknown keyword '{keyword}' in step {step_id}")]
    UnknownKeyword { step_id: String, keyword: String },

    #[error("invalid execution options: {reason}")]
    InvalidOptions { reason: String },
}

/// What happens to the task when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the remaining steps of the iteration (default)
    #[default]
    Stop,
    /// Record the failure and continue with the next step
    Continue,
}

/// A keyword occurrence inside a step's pre- or post-processor list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    pub keyword: String,
    #[serde(default)]
    pub params: Value,
}

/// One typed step of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Selects the step executor (http, script, wait, db_query, ...)
    #[serde(rename = "type")]
    pub step_type: String,

    /// Executor-specific configuration
    #[serde(default)]
    pub config: Value,

    #[serde(default, rename = "pre-processors")]
    pub pre_processors: Vec<Processor>,

    #[serde(default, rename = "post-processors")]
    pub post_processors: Vec<Processor>,

    /// Per-step timeout; enforced by the pipeline via cancellation
    #[serde(default, rename = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    #[serde(default, rename = "on-failure")]
    pub on_failure: FailurePolicy,
}

/// Comparison operator of a threshold expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl ThresholdOp {
    /// Apply the operator to `actual op expected`
    pub fn holds(&self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Eq => (actual - expected).abs() < f64::EPSILON,
        }
    }
}

/// A pass/fail criterion over aggregated metrics
///
/// The metric is a dotted path: `<step-id>.duration.<stat>` where stat is
/// one of avg/min/max/p50/p90/p95/p99, or `<step-id>.<counter>` where
/// counter is one of count/success-count/failure-count/error-rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub op: ThresholdOp,
    pub value: f64,
    #[serde(default, rename = "abort-on-fail")]
    pub abort_on_fail: bool,
}

/// Configuration for one output sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub settings: Value,
}

/// A declarative workflow: an ordered sequence of typed steps with
/// keyword-driven pre- and post-processors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial variables seeded into every iteration's context
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Label selectors a slave must match to be eligible
    #[serde(default)]
    pub selector: HashMap<String, String>,

    #[serde(default)]
    pub options: ExecutionOptions,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,

    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

impl Workflow {
    /// Fill in omitted fields: a name from the id and option defaults
    pub fn apply_defaults(&mut self) {
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        self.options.apply_defaults();
    }

    /// Validate structure against the known step types and keywords
    ///
    /// `known_types` and `known_keywords` come from the executor set and
    /// keyword registry of the node that accepted the workflow.
    pub fn validate(&self, known_types: &[String], known_keywords: &[String]) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyWorkflowId);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }

        self.options
            .validate()
            .map_err(|reason| ValidationError::InvalidOptions { reason })?;

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() || step.step_type.is_empty() {
                return Err(ValidationError::EmptyStepField {
                    step_id: step.id.clone(),
                });
            }
            if !seen.insert(step.id.clone()) {
                return Err(ValidationError::DuplicateStepId { id: step.id.clone() });
            }
            if !known_types.iter().any(|t| t == &step.step_type) {
                return Err(ValidationError::UnknownStepType {
                    step_id: step.id.clone(),
                    step_type: step.step_type.clone(),
                });
            }
            for proc in step.pre_processors.iter().chain(step.post_processors.iter()) {
                if !known_keywords.iter().any(|k| k == &proc.keyword) {
                    return Err(ValidationError::UnknownKeyword {
                        step_id: step.id.clone(),
                        keyword: proc.keyword.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Capability strings required by this workflow's step types
    ///
    /// A slave must advertise every one of these to be eligible.
    pub fn required_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.steps.iter().map(|s| s.step_type.clone()).collect();
        caps.sort();
        caps.dedup();
        caps
    }
}
