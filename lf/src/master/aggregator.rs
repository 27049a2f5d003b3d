//! Per-execution metrics aggregator
//!
//! One aggregator task per execution owns the accumulator; every write
//! arrives over its channel, which serializes them without a lock.
//! Reports are deduplicated by `(slave id, batch seq)`, so at-least-once
//! delivery never over-counts. Duration percentiles come from merged
//! fixed-bucket histograms (see `flowkit::domain::DurationHistogram`).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use flowkit::domain::{MetricsReport, StepMetrics, SystemMetrics, TaskResult, Threshold};

/// Read-side summary for one step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepSummary {
    pub step_id: String,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

impl StepSummary {
    fn from_metrics(metrics: &StepMetrics) -> Self {
        Self {
            step_id: metrics.step_id.clone(),
            count: metrics.count,
            success_count: metrics.success_count,
            failure_count: metrics.failure_count,
            min_ms: metrics.duration.min_ms(),
            max_ms: metrics.duration.max_ms(),
            avg_ms: metrics.duration.avg_ms(),
            p50_ms: metrics.duration.percentile(50.0),
            p90_ms: metrics.duration.percentile(90.0),
            p95_ms: metrics.duration.percentile(95.0),
            p99_ms: metrics.duration.percentile(99.0),
            custom: metrics.custom.clone(),
        }
    }
}

/// Aggregated metrics snapshot for one execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionMetrics {
    pub iterations: u64,
    pub steps: Vec<StepSummary>,
    /// Reported buffer-overflow losses across all slaves
    pub dropped: u64,
    pub reports: u64,
    pub duplicates: u64,
    #[serde(default)]
    pub system: HashMap<String, SystemMetrics>,
}

impl ExecutionMetrics {
    pub fn step(&self, step_id: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn total_count(&self) -> u64 {
        self.steps.iter().map(|s| s.count).sum()
    }

    pub fn error_rate(&self) -> f64 {
        let count = self.total_count();
        if count == 0 {
            return 0.0;
        }
        let failures: u64 = self.steps.iter().map(|s| s.failure_count).sum();
        failures as f64 / count as f64
    }
}

/// Evaluation of one threshold at terminal aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThresholdOutcome {
    pub threshold: Threshold,
    /// `None` when the metric never materialized
    pub actual: Option<f64>,
    pub passed: bool,
}

/// Terminal aggregation result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FinalReport {
    pub metrics: ExecutionMetrics,
    pub thresholds: Vec<ThresholdOutcome>,
    pub passed: bool,
    /// True when a failed threshold was marked abort-on-fail
    pub abort_failed: bool,
    /// Per-task outcomes, filled in by the master runtime
    #[serde(default)]
    pub tasks: Vec<TaskResult>,
}

enum AggregatorMsg {
    Report(MetricsReport),
    Snapshot { reply: oneshot::Sender<ExecutionMetrics> },
    Finalize {
        thresholds: Vec<Threshold>,
        reply: oneshot::Sender<FinalReport>,
    },
}

/// Handle to one execution's aggregator task
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggregatorMsg>,
}

impl AggregatorHandle {
    /// Fold a report in; duplicates are dropped inside the actor
    pub async fn report(&self, report: MetricsReport) {
        let _ = self.tx.send(AggregatorMsg::Report(report)).await;
    }

    pub async fn snapshot(&self) -> ExecutionMetrics {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(AggregatorMsg::Snapshot { reply }).await.is_err() {
            return ExecutionMetrics::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Evaluate thresholds over the accumulated metrics
    pub async fn finalize(&self, thresholds: Vec<Threshold>) -> FinalReport {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(AggregatorMsg::Finalize { thresholds, reply }).await.is_err() {
            return FinalReport {
                metrics: ExecutionMetrics::default(),
                thresholds: Vec::new(),
                passed: true,
                abort_failed: false,
                tasks: Vec::new(),
            };
        }
        rx.await.unwrap_or(FinalReport {
            metrics: ExecutionMetrics::default(),
            thresholds: Vec::new(),
            passed: true,
            abort_failed: false,
            tasks: Vec::new(),
        })
    }
}

#[derive(Default)]
struct AggregatorState {
    steps: HashMap<String, StepMetrics>,
    seen: HashSet<(String, u64)>,
    iterations: u64,
    dropped: u64,
    reports: u64,
    duplicates: u64,
    system: HashMap<String, SystemMetrics>,
}

impl AggregatorState {
    fn apply(&mut self, report: MetricsReport) {
        let key = (report.slave_id.clone(), report.batch_seq);
        if !self.seen.insert(key) {
            self.duplicates += 1;
            debug!(
                slave_id = %report.slave_id,
                batch_seq = report.batch_seq,
                "duplicate metrics batch dropped"
            );
            return;
        }
        self.reports += 1;
        self.iterations += report.iterations;
        self.dropped += report.dropped;
        if let Some(system) = report.system {
            self.system.insert(report.slave_id.clone(), system);
        }
        for metrics in report.step_metrics {
            self.steps
                .entry(metrics.step_id.clone())
                .or_insert_with(|| StepMetrics::new(metrics.step_id.clone()))
                .merge(&metrics);
        }
    }

    fn snapshot(&self) -> ExecutionMetrics {
        let mut steps: Vec<StepSummary> = self.steps.values().map(StepSummary::from_metrics).collect();
        steps.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        ExecutionMetrics {
            iterations: self.iterations,
            steps,
            dropped: self.dropped,
            reports: self.reports,
            duplicates: self.duplicates,
            system: self.system.clone(),
        }
    }
}

/// Resolve a threshold metric path against the aggregated metrics
///
/// Paths: `<step>.duration.<min|max|avg|p50|p90|p95|p99>` and
/// `<step>.<count|success-count|failure-count|error-rate>`.
fn metric_value(metrics: &ExecutionMetrics, path: &str) -> Option<f64> {
    let mut parts = path.split('.');
    let step_id = parts.next()?;
    let field = parts.next()?;
    let summary = metrics.step(step_id)?;
    match (field, parts.next()) {
        ("duration", Some(stat)) => match stat {
            "min" => Some(summary.min_ms),
            "max" => Some(summary.max_ms),
            "avg" => Some(summary.avg_ms),
            "p50" => Some(summary.p50_ms),
            "p90" => Some(summary.p90_ms),
            "p95" => Some(summary.p95_ms),
            "p99" => Some(summary.p99_ms),
            _ => None,
        },
        ("count", None) => Some(summary.count as f64),
        ("success-count", None) => Some(summary.success_count as f64),
        ("failure-count", None) => Some(summary.failure_count as f64),
        ("error-rate", None) => {
            if summary.count == 0 {
                Some(0.0)
            } else {
                Some(summary.failure_count as f64 / summary.count as f64)
            }
        }
        _ => None,
    }
}

fn evaluate(metrics: &ExecutionMetrics, thresholds: Vec<Threshold>) -> FinalReport {
    let mut outcomes = Vec::with_capacity(thresholds.len());
    let mut passed = true;
    let mut abort_failed = false;
    for threshold in thresholds {
        let actual = metric_value(metrics, &threshold.metric);
        // an absent metric fails the threshold
        let ok = actual.map(|a| threshold.op.holds(a, threshold.value)).unwrap_or(false);
        if !ok {
            passed = false;
            if threshold.abort_on_fail {
                abort_failed = true;
            }
            warn!(metric = %threshold.metric, ?actual, "threshold failed");
        }
        outcomes.push(ThresholdOutcome {
            threshold,
            actual,
            passed: ok,
        });
    }
    FinalReport {
        metrics: metrics.clone(),
        thresholds: outcomes,
        passed,
        abort_failed,
        tasks: Vec::new(),
    }
}

/// Spawn the aggregator task for one execution
pub fn spawn_aggregator(execution_id: String) -> AggregatorHandle {
    let (tx, mut rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut state = AggregatorState::default();
        while let Some(msg) = rx.recv().await {
            match msg {
                AggregatorMsg::Report(report) => {
                    if report.execution_id != execution_id {
                        warn!(
                            expected = %execution_id,
                            got = %report.execution_id,
                            "metrics routed to the wrong aggregator"
                        );
                        continue;
                    }
                    state.apply(report);
                }
                AggregatorMsg::Snapshot { reply } => {
                    let _ = reply.send(state.snapshot());
                }
                AggregatorMsg::Finalize { thresholds, reply } => {
                    let _ = reply.send(evaluate(&state.snapshot(), thresholds));
                }
            }
        }
        debug!(%execution_id, "aggregator stopped");
    });
    AggregatorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::domain::ThresholdOp;
    use flowkit::now_ms;

    fn report(slave: &str, seq: u64, step: &str, count: u64, failures: u64, ms: f64) -> MetricsReport {
        let mut metrics = StepMetrics::new(step);
        for i in 0..count {
            metrics.record(i >= failures, ms);
        }
        MetricsReport {
            slave_id: slave.to_string(),
            execution_id: "e1".to_string(),
            batch_seq: seq,
            iterations: count,
            step_metrics: vec![metrics],
            system: None,
            dropped: 0,
            timestamp_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_reports_merge_across_slaves() {
        let agg = spawn_aggregator("e1".to_string());
        agg.report(report("a", 1, "s1", 10, 1, 50.0)).await;
        agg.report(report("b", 1, "s1", 20, 0, 100.0)).await;

        let snap = agg.snapshot().await;
        assert_eq!(snap.iterations, 30);
        let s1 = snap.step("s1").unwrap();
        assert_eq!(s1.count, 30);
        assert_eq!(s1.failure_count, 1);
        assert!(s1.p50_ms <= s1.p90_ms && s1.p90_ms <= s1.p95_ms && s1.p95_ms <= s1.p99_ms);
    }

    #[tokio::test]
    async fn test_duplicate_batches_do_not_over_count() {
        let agg = spawn_aggregator("e1".to_string());
        let r = report("a", 7, "s1", 10, 0, 10.0);
        agg.report(r.clone()).await;
        agg.report(r).await;

        let snap = agg.snapshot().await;
        assert_eq!(snap.step("s1").unwrap().count, 10);
        assert_eq!(snap.iterations, 10);
        assert_eq!(snap.duplicates, 1);
    }

    #[tokio::test]
    async fn test_same_seq_different_slaves_both_count() {
        let agg = spawn_aggregator("e1".to_string());
        agg.report(report("a", 1, "s1", 5, 0, 10.0)).await;
        agg.report(report("b", 1, "s1", 5, 0, 10.0)).await;
        let snap = agg.snapshot().await;
        assert_eq!(snap.step("s1").unwrap().count, 10);
    }

    #[tokio::test]
    async fn test_threshold_evaluation() {
        let agg = spawn_aggregator("e1".to_string());
        agg.report(report("a", 1, "s1", 100, 5, 50.0)).await;

        let report = agg
            .finalize(vec![
                Threshold {
                    metric: "s1.duration.avg".to_string(),
                    op: ThresholdOp::Lt,
                    value: 500.0,
                    abort_on_fail: false,
                },
                Threshold {
                    metric: "s1.error-rate".to_string(),
                    op: ThresholdOp::Lt,
                    value: 0.01,
                    abort_on_fail: true,
                },
            ])
            .await;

        assert!(!report.passed);
        assert!(report.abort_failed);
        assert!(report.thresholds[0].passed);
        assert!(!report.thresholds[1].passed);
        assert_eq!(report.thresholds[1].actual, Some(0.05));
    }

    #[tokio::test]
    async fn test_unknown_metric_fails_threshold() {
        let agg = spawn_aggregator("e1".to_string());
        let report = agg
            .finalize(vec![Threshold {
                metric: "nope.duration.avg".to_string(),
                op: ThresholdOp::Lt,
                value: 1.0,
                abort_on_fail: false,
            }])
            .await;
        assert!(!report.passed);
        assert!(!report.abort_failed);
        assert_eq!(report.thresholds[0].actual, None);
    }

    #[tokio::test]
    async fn test_wrong_execution_reports_ignored() {
        let agg = spawn_aggregator("e1".to_string());
        let mut r = report("a", 1, "s1", 5, 0, 10.0);
        r.execution_id = "other".to_string();
        agg.report(r).await;
        let snap = agg.snapshot().await;
        assert_eq!(snap.total_count(), 0);
    }
}
