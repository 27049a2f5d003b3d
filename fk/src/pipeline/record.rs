//! Execution records produced by the step pipeline

use serde::{Deserialize, Serialize};

/// Which phase of the step an action ran in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Pre,
    Main,
    Post,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "pre"),
            Self::Main => write!(f, "main"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// One attempted action, in declared order within its phase
///
/// Every attempted action is recorded, so a failed step still exposes its
/// partial history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ActionRecord {
    pub keyword: String,
    pub order: usize,
    pub phase: Phase,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Final status of a step run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    /// Cancellation is not a failure
    Aborted,
}

/// Result of running one step through the pipeline
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    pub records: Vec<ActionRecord>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}
