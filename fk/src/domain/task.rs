//! Tasks: units of work assigned to one slave

use serde::{Deserialize, Serialize};

use super::metrics::MetricsReport;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Assigned,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Progressive status report for a task, slave → master
///
/// One or more updates are sent per task; the last one carries a terminal
/// status. `seq` increases per task so the master can apply updates
/// idempotently under at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskUpdate {
    pub task_id: String,
    pub execution_id: String,
    pub slave_id: String,
    pub seq: u64,
    pub status: TaskStatus,
    /// Fraction of the task's work done, in `[0, 1]`
    pub progress: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    pub timestamp_ms: i64,
}

impl TaskUpdate {
    /// Whether this update carries the busy-rejection marker
    pub fn is_busy_rejection(&self) -> bool {
        self.status == TaskStatus::Aborted && self.errors.iter().any(|e| e == "slave busy")
    }
}

/// Final outcome of a task as recorded by the master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskResult {
    pub task_id: String,
    pub execution_id: String,
    pub slave_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub metrics: Option<MetricsReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_busy_rejection_marker() {
        let update = TaskUpdate {
            task_id: "t1".to_string(),
            execution_id: "e1".to_string(),
            slave_id: "s1".to_string(),
            seq: 1,
            status: TaskStatus::Aborted,
            progress: 0.0,
            errors: vec!["slave busy".to_string()],
            timestamp_ms: 0,
        };
        assert!(update.is_busy_rejection());

        let normal = TaskUpdate {
            status: TaskStatus::Failed,
            errors: vec!["step failed".to_string()],
            ..update
        };
        assert!(!normal.is_busy_rejection());
    }

    #[test]
    fn test_status_serde_kebab() {
        assert_eq!(serde_json::to_string(&TaskStatus::Completed).unwrap(), "\"completed\"");
        let s: TaskStatus = serde_json::from_str("\"aborted\"").unwrap();
        assert_eq!(s, TaskStatus::Aborted);
    }
}
