//! Execution lifecycle state
//!
//! Tracks one end-to-end run of a workflow. Terminal statuses are
//! absorbing: once completed, failed, or aborted, no further transitions
//! are allowed.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Whether the state machine permits `self -> next`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Pending, Failed) => true,
            // stop is allowed from any non-terminal state
            (_, Aborted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Snapshot of one execution's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// `tasks completed / tasks total` when known
    pub progress: f64,
    pub active_slaves: Vec<String>,
    pub started_at_ms: i64,
    #[serde(default)]
    pub finished_at_ms: Option<i64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ExecutionState {
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            progress: 0.0,
            active_slaves: Vec::new(),
            started_at_ms: crate::now_ms(),
            finished_at_ms: None,
            errors: Vec::new(),
        }
    }

    /// Apply a transition; returns false (and leaves state untouched) if
    /// the state machine forbids it.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at_ms = Some(crate::now_ms());
        }
        true
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut st = ExecutionState::new("e1", "w1");
        assert!(st.transition(ExecutionStatus::Running));
        assert!(st.transition(ExecutionStatus::Paused));
        assert!(st.transition(ExecutionStatus::Running));
        assert!(st.transition(ExecutionStatus::Completed));
        assert!(st.finished_at_ms.is_some());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Aborted,
        ] {
            let mut st = ExecutionState::new("e1", "w1");
            assert!(st.transition(ExecutionStatus::Running));
            assert!(st.transition(terminal));
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Aborted,
            ] {
                assert!(!st.transition(next), "{terminal} must absorb {next}");
            }
            assert_eq!(st.status, terminal);
        }
    }

    #[test]
    fn test_stop_from_any_non_terminal() {
        for from in [ExecutionStatus::Pending, ExecutionStatus::Running, ExecutionStatus::Paused] {
            assert!(from.can_transition_to(ExecutionStatus::Aborted));
        }
    }

    #[test]
    fn test_pending_cannot_pause() {
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Paused));
    }

    #[test]
    fn test_paused_cannot_complete_directly() {
        assert!(!ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Completed));
    }
}
