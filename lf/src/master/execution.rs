//! Execution state tracking
//!
//! A shared map of execution states. The master runtime is the only
//! writer; the realtime status surface reads snapshots. All mutations go
//! through the transition rules on `ExecutionStatus`, so terminal states
//! are absorbing here by construction.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use flowkit::domain::{ExecutionState, ExecutionStatus};

/// Shared, read-mostly map of execution lifecycles
#[derive(Clone, Default)]
pub struct ExecutionTracker {
    inner: Arc<RwLock<HashMap<String, ExecutionState>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: ExecutionState) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.execution_id.clone(), state);
    }

    /// Apply a lifecycle transition; false when the state machine forbids it
    pub fn transition(&self, execution_id: &str, next: ExecutionStatus) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = inner.get_mut(execution_id) else {
            warn!(%execution_id, "transition on unknown execution");
            return false;
        };
        let from = state.status;
        let ok = state.transition(next);
        if ok {
            debug!(%execution_id, %from, to = %next, "execution transition");
        } else {
            debug!(%execution_id, %from, to = %next, "transition rejected");
        }
        ok
    }

    pub fn set_progress(&self, execution_id: &str, progress: f64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = inner.get_mut(execution_id) {
            // progress never runs backwards
            state.progress = state.progress.max(progress.clamp(0.0, 1.0));
        }
    }

    pub fn set_active_slaves(&self, execution_id: &str, slaves: Vec<String>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = inner.get_mut(execution_id) {
            state.active_slaves = slaves;
        }
    }

    pub fn record_error(&self, execution_id: &str, error: impl Into<String>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = inner.get_mut(execution_id) {
            state.record_error(error);
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionState> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ExecutionState> {
        let mut states: Vec<ExecutionState> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        states.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms));
        states
    }

    /// Remove a terminal execution; refuses to purge a live one
    pub fn purge(&self, execution_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.get(execution_id) {
            Some(state) if state.status.is_terminal() => {
                inner.remove(execution_id);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(id: &str) -> ExecutionTracker {
        let tracker = ExecutionTracker::new();
        tracker.insert(ExecutionState::new(id, "w1"));
        tracker
    }

    #[test]
    fn test_transition_and_terminal_absorption() {
        let tracker = tracker_with("e1");
        assert!(tracker.transition("e1", ExecutionStatus::Running));
        assert!(tracker.transition("e1", ExecutionStatus::Completed));
        assert!(!tracker.transition("e1", ExecutionStatus::Running));
        assert!(!tracker.transition("e1", ExecutionStatus::Aborted));
        assert_eq!(tracker.get("e1").unwrap().status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_progress_is_monotone() {
        let tracker = tracker_with("e1");
        tracker.set_progress("e1", 0.5);
        tracker.set_progress("e1", 0.3);
        assert_eq!(tracker.get("e1").unwrap().progress, 0.5);
        tracker.set_progress("e1", 2.0);
        assert_eq!(tracker.get("e1").unwrap().progress, 1.0);
    }

    #[test]
    fn test_purge_requires_terminal() {
        let tracker = tracker_with("e1");
        tracker.transition("e1", ExecutionStatus::Running);
        assert!(!tracker.purge("e1"));
        tracker.transition("e1", ExecutionStatus::Aborted);
        assert!(tracker.purge("e1"));
        assert!(tracker.get("e1").is_none());
    }

    #[test]
    fn test_unknown_execution() {
        let tracker = ExecutionTracker::new();
        assert!(!tracker.transition("missing", ExecutionStatus::Running));
        assert!(tracker.get("missing").is_none());
    }
}
