//! Workflow scheduler: eligibility, segment partitioning, assignment
//!
//! Given a workflow and the current registry snapshot, the scheduler
//! filters eligible slaves, partitions the load space `[0, 1)`
//! proportionally to their VU capacity (ordered by slave id, so
//! partitions are deterministic), and produces one task per segment.
//! Reassignment after a slave loss picks the least-loaded remaining
//! candidate.

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use flowkit::domain::{ExecutionSegment, SlaveState, Workflow};

use super::registry::SlaveEntry;
use crate::transport::TaskAssignment;

/// Scheduling failures
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no eligible slaves")]
    NoEligibleSlaves,

    #[error("no assignable slave for segment")]
    NoAssignableSlave,
}

/// One task bound for one slave
#[derive(Debug, Clone)]
pub struct PlannedAssignment {
    pub slave_id: String,
    pub assignment: TaskAssignment,
}

/// Stateless planning over registry snapshots
#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Whether a slave can take work for this workflow right now
    fn eligible(workflow: &Workflow, entry: &SlaveEntry) -> bool {
        if entry.status.state != SlaveState::Online {
            return false;
        }
        // at capacity counts as busy even while online
        if entry.status.active_tasks >= entry.info.caps.max_vus {
            return false;
        }
        entry.info.covers(&workflow.required_capabilities()) && entry.info.matches_labels(&workflow.selector)
    }

    fn eligible_slaves<'a>(&self, workflow: &Workflow, slaves: &'a [SlaveEntry]) -> Vec<&'a SlaveEntry> {
        let mut eligible: Vec<&SlaveEntry> = slaves.iter().filter(|e| Self::eligible(workflow, e)).collect();
        eligible.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        eligible
    }

    /// Partition the workflow's load across all eligible slaves
    pub fn plan(
        &self,
        workflow: &Workflow,
        execution_id: &str,
        slaves: &[SlaveEntry],
    ) -> Result<Vec<PlannedAssignment>, ScheduleError> {
        let eligible = self.eligible_slaves(workflow, slaves);
        if eligible.is_empty() {
            return Err(ScheduleError::NoEligibleSlaves);
        }

        let weights: Vec<u64> = eligible.iter().map(|e| u64::from(e.info.caps.max_vus)).collect();
        let segments = ExecutionSegment::partition(&weights);

        let mut planned = Vec::new();
        for (entry, segment) in eligible.iter().zip(segments) {
            let Some(segment) = segment else { continue };
            let task = self.make_task(workflow, execution_id, segment);
            debug!(
                slave_id = %entry.info.id,
                task_id = %task.task_id,
                %segment,
                "planned assignment"
            );
            planned.push(PlannedAssignment {
                slave_id: entry.info.id.clone(),
                assignment: task,
            });
        }
        Ok(planned)
    }

    /// Build an assignment for an arbitrary segment (used for reassignment)
    pub fn make_task(&self, workflow: &Workflow, execution_id: &str, segment: ExecutionSegment) -> TaskAssignment {
        TaskAssignment {
            task_id: Uuid::now_v7().to_string(),
            execution_id: execution_id.to_string(),
            workflow: workflow.clone(),
            segment,
            options: workflow.options.clone(),
        }
    }

    /// Next-best candidate for a segment, excluding given slaves
    ///
    /// Capability ties break on lower load, then lexicographic id.
    pub fn reassignment_target<'a>(
        &self,
        workflow: &Workflow,
        slaves: &'a [SlaveEntry],
        exclude: &[String],
    ) -> Option<&'a SlaveEntry> {
        slaves
            .iter()
            .filter(|e| !exclude.contains(&e.info.id))
            .filter(|e| Self::eligible(workflow, e))
            .min_by(|a, b| {
                a.status
                    .load
                    .total_cmp(&b.status.load)
                    .then_with(|| a.info.id.cmp(&b.info.id))
            })
    }

    /// The part of a lost task's segment not yet executed, going by its
    /// last reported progress. `None` when nothing remains.
    pub fn remaining_segment(&self, segment: ExecutionSegment, progress: f64) -> Option<ExecutionSegment> {
        let progress = progress.clamp(0.0, 1.0);
        if progress >= 1.0 {
            return None;
        }
        let start = segment.start + progress * segment.length();
        ExecutionSegment::new(start, segment.end)
    }
}
