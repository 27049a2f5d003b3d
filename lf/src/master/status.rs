//! Realtime status surface
//!
//! A publisher task per execution samples the tracker and aggregator at
//! the configured cadence and broadcasts snapshots; one final snapshot is
//! emitted once the execution turns terminal.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use flowkit::domain::ExecutionStatus;
use flowkit::now_ms;

use super::aggregator::{AggregatorHandle, StepSummary};
use super::execution::ExecutionTracker;
use super::output::{OutputManager, SampleContainer};

/// One published status frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusSnapshot {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub elapsed_ms: u64,
    pub vus: u32,
    pub iterations: u64,
    pub qps: f64,
    pub error_rate: f64,
    pub step_metrics: Vec<StepSummary>,
    pub errors: Vec<String>,
    pub timestamp_ms: i64,
}

/// Periodically publish snapshots until the execution is terminal
pub fn spawn_status_publisher(
    execution_id: String,
    interval: Duration,
    vus: u32,
    tracker: ExecutionTracker,
    aggregator: AggregatorHandle,
    outputs: Arc<OutputManager>,
    tx: broadcast::Sender<StatusSnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(state) = tracker.get(&execution_id) else {
                // purged mid-run
                break;
            };
            let metrics = aggregator.snapshot().await;
            let now = now_ms();
            let end = state.finished_at_ms.unwrap_or(now);
            let elapsed_ms = (end - state.started_at_ms).max(0) as u64;
            let qps = if elapsed_ms > 0 {
                metrics.iterations as f64 / (elapsed_ms as f64 / 1000.0)
            } else {
                0.0
            };

            let snapshot = StatusSnapshot {
                execution_id: execution_id.clone(),
                status: state.status,
                elapsed_ms,
                vus,
                iterations: metrics.iterations,
                qps,
                error_rate: metrics.error_rate(),
                step_metrics: metrics.steps.clone(),
                errors: state.errors.clone(),
                timestamp_ms: now,
            };

            outputs
                .add_samples(SampleContainer {
                    execution_id: execution_id.clone(),
                    timestamp_ms: now,
                    steps: metrics.steps,
                })
                .await;
            let _ = tx.send(snapshot);

            if state.status.is_terminal() {
                outputs.set_run_status(state.status).await;
                debug!(%execution_id, status = %state.status, "status publisher finished");
                break;
            }
        }
    })
}
