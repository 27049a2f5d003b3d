//! Task worker: drives workflow iterations for one assigned segment
//!
//! A task spawns one driver per allotted VU. Drivers pass an admission
//! gate before every iteration (pause and the effective VU cap), run the
//! keyword pipeline with a fresh context per iteration, and feed a shared
//! metrics collector that is flushed in batches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowkit::context::ExecutionContext;
use flowkit::domain::{ExecutionMode, MetricsReport, Stage, StepMetrics, TaskStatus, TaskUpdate};
use flowkit::now_ms;
use flowkit::pipeline::StepPipeline;

use crate::transport::TaskAssignment;

const ERROR_SAMPLE_LIMIT: usize = 10;

/// Where a worker's emissions go (the slave buffers them; standalone mode
/// routes them straight back into the master)
#[derive(Clone)]
pub struct TaskSink {
    pub slave_id: String,
    pub updates: mpsc::Sender<TaskUpdate>,
    pub metrics: mpsc::Sender<MetricsReport>,
}

/// Pause/scale gates shared by all drivers on a slave
#[derive(Clone)]
pub struct Gates {
    paused: watch::Receiver<bool>,
    cap: watch::Receiver<u32>,
}

/// Command-plane side of the gates
pub struct GateControl {
    paused: watch::Sender<bool>,
    cap: watch::Sender<u32>,
}

impl GateControl {
    /// Create a gate pair with the given effective VU cap
    pub fn new(cap: u32) -> (GateControl, Gates) {
        let (paused_tx, paused_rx) = watch::channel(false);
        let (cap_tx, cap_rx) = watch::channel(cap);
        (
            GateControl {
                paused: paused_tx,
                cap: cap_tx,
            },
            Gates {
                paused: paused_rx,
                cap: cap_rx,
            },
        )
    }

    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// Adjust the effective VU cap; drivers above it idle until resumed
    pub fn scale(&self, cap: u32) {
        let _ = self.cap.send(cap);
    }

    pub fn cap(&self) -> u32 {
        *self.cap.borrow()
    }

    /// Fresh gate receivers bound to this control
    pub fn subscribe(&self) -> Gates {
        Gates {
            paused: self.paused.subscribe(),
            cap: self.cap.subscribe(),
        }
    }
}

impl Gates {
    /// Wait until this driver may dispatch an iteration
    ///
    /// Returns false when cancellation fires while gated.
    pub async fn admit(&mut self, vu_index: u32, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if !*self.paused.borrow() && vu_index < *self.cap.borrow() {
                return true;
            }
            tokio::select! {
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = self.cap.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                () = cancel.cancelled() => return false,
            }
        }
    }
}

#[derive(Default)]
struct Collector {
    steps: HashMap<String, StepMetrics>,
    iterations: u64,
    failed_iterations: u64,
    errors: Vec<String>,
}

impl Collector {
    fn record(&mut self, outcome: &flowkit::pipeline::IterationOutcome) {
        if outcome.aborted {
            // metrics stop at the cancellation point
            return;
        }
        self.iterations += 1;
        if !outcome.success {
            self.failed_iterations += 1;
        }
        for (step_id, step_outcome) in &outcome.steps {
            if step_outcome.status == flowkit::pipeline::OutcomeStatus::Aborted {
                continue;
            }
            self.steps
                .entry(step_id.clone())
                .or_insert_with(|| StepMetrics::new(step_id.clone()))
                .record(step_outcome.is_success(), step_outcome.duration_ms as f64);
            if let Some(error) = &step_outcome.error
                && self.errors.len() < ERROR_SAMPLE_LIMIT
            {
                self.errors.push(format!("{step_id}: {error}"));
            }
        }
    }

    fn drain(&mut self) -> (Vec<StepMetrics>, u64) {
        let steps = std::mem::take(&mut self.steps).into_values().collect();
        let iterations = std::mem::take(&mut self.iterations);
        (steps, iterations)
    }
}

struct Plan {
    my_vus: u32,
    /// Iteration target for this task; `None` for duration-bound runs
    target: Option<u64>,
    /// Wall-clock bound; `None` for iteration-bound runs
    deadline_ms: Option<u64>,
    /// Shared cursor for shared-iterations pulls
    cursor: Option<(Arc<AtomicU64>, u64)>,
    stages: Vec<Stage>,
}

fn plan_for(assignment: &TaskAssignment) -> Plan {
    let options = &assignment.options;
    let segment = assignment.segment;
    let my_vus = segment.vus_of(options.vus).max(1);

    match options.execution_mode {
        ExecutionMode::SharedIterations => {
            let (lo, hi) = segment.iteration_range(options.iterations);
            Plan {
                my_vus,
                target: Some(hi.saturating_sub(lo)),
                deadline_ms: None,
                cursor: Some((Arc::new(AtomicU64::new(lo)), hi)),
                stages: Vec::new(),
            }
        }
        ExecutionMode::PerVuIterations => Plan {
            my_vus,
            target: Some(options.iterations * u64::from(my_vus)),
            deadline_ms: None,
            cursor: None,
            stages: Vec::new(),
        },
        ExecutionMode::RampingVus => {
            let total: u64 = options.stages.iter().map(|s| s.duration_ms).sum();
            Plan {
                my_vus: options
                    .stages
                    .iter()
                    .map(|s| segment.vus_of(s.target).max(1))
                    .max()
                    .unwrap_or(my_vus),
                target: None,
                deadline_ms: Some(total),
                cursor: None,
                stages: options.stages.clone(),
            }
        }
        ExecutionMode::ConstantVus => {
            if options.duration_ms > 0 {
                Plan {
                    my_vus,
                    target: None,
                    deadline_ms: Some(options.duration_ms),
                    cursor: None,
                    stages: Vec::new(),
                }
            } else {
                // iteration-bound constant mode splits like shared-iterations
                let (lo, hi) = segment.iteration_range(options.iterations);
                Plan {
                    my_vus,
                    target: Some(hi.saturating_sub(lo)),
                    deadline_ms: None,
                    cursor: Some((Arc::new(AtomicU64::new(lo)), hi)),
                    stages: Vec::new(),
                }
            }
        }
    }
}

/// VU target at `elapsed` into a staged profile, scaled to this segment
fn stage_target(stages: &[Stage], segment: flowkit::domain::ExecutionSegment, elapsed_ms: u64) -> u32 {
    let mut offset = 0u64;
    for stage in stages {
        if elapsed_ms < offset + stage.duration_ms {
            return segment.vus_of(stage.target).max(1);
        }
        offset += stage.duration_ms;
    }
    stages.last().map(|s| segment.vus_of(s.target).max(1)).unwrap_or(1)
}

#[allow(clippy::too_many_arguments)]
async fn driver_loop(
    vu_index: u32,
    assignment: Arc<TaskAssignment>,
    pipeline: Arc<StepPipeline>,
    collector: Arc<Mutex<Collector>>,
    mut gates: Gates,
    cancel: CancellationToken,
    plan_cursor: Option<(Arc<AtomicU64>, u64)>,
    per_vu_target: Option<u64>,
    deadline: Option<Instant>,
    stages: Arc<Vec<Stage>>,
    started: Instant,
) {
    let mut local_done = 0u64;
    loop {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            break;
        }
        if !gates.admit(vu_index, &cancel).await {
            break;
        }
        // staged profiles gate on the current target as well
        if !stages.is_empty() {
            let target = stage_target(&stages, assignment.segment, started.elapsed().as_millis() as u64);
            if vu_index >= target {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    () = cancel.cancelled() => break,
                }
            }
        }
        match &plan_cursor {
            Some((cursor, hi)) => {
                if cursor.fetch_add(1, Ordering::SeqCst) >= *hi {
                    break;
                }
            }
            None => {
                if let Some(target) = per_vu_target
                    && local_done >= target
                {
                    break;
                }
            }
        }

        let ctx = ExecutionContext::seeded(assignment.workflow.variables.clone());
        ctx.set_metadata("execution-id", assignment.execution_id.clone());
        ctx.set_metadata("task-id", assignment.task_id.clone());
        ctx.set_metadata("vu", vu_index.to_string());

        let outcome = pipeline.run_iteration(&assignment.workflow, &ctx, &cancel).await;
        let aborted = outcome.aborted;
        collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&outcome);
        local_done += 1;
        if aborted {
            break;
        }
    }
}

async fn send_update(
    sink: &TaskSink,
    assignment: &TaskAssignment,
    seq: &mut u64,
    status: TaskStatus,
    progress: f64,
    errors: Vec<String>,
) {
    *seq += 1;
    let update = TaskUpdate {
        task_id: assignment.task_id.clone(),
        execution_id: assignment.execution_id.clone(),
        slave_id: sink.slave_id.clone(),
        seq: *seq,
        status,
        progress: progress.clamp(0.0, 1.0),
        errors,
        timestamp_ms: now_ms(),
    };
    let _ = sink.updates.send(update).await;
}

/// Execute one task assignment to completion
///
/// Sends a `running` update up front, progress updates and metrics
/// batches as work proceeds, and a terminal update (`completed`, or
/// `aborted` under cancellation) with the final metrics flush.
pub async fn run_task(
    assignment: TaskAssignment,
    pipeline: Arc<StepPipeline>,
    sink: TaskSink,
    gates: Gates,
    cancel: CancellationToken,
    batch_seq: Arc<AtomicU64>,
) {
    let plan = plan_for(&assignment);
    let assignment = Arc::new(assignment);
    let collector = Arc::new(Mutex::new(Collector::default()));
    let started = Instant::now();
    let deadline = plan.deadline_ms.map(|ms| started + Duration::from_millis(ms));
    let stages = Arc::new(plan.stages);
    let mut update_seq = 0u64;

    send_update(&sink, &assignment, &mut update_seq, TaskStatus::Running, 0.0, Vec::new()).await;

    let per_vu_target = match (&plan.cursor, plan.target) {
        (None, Some(total)) => Some(total / u64::from(plan.my_vus.max(1))),
        _ => None,
    };

    let mut drivers = JoinSet::new();
    for vu_index in 0..plan.my_vus {
        drivers.spawn(driver_loop(
            vu_index,
            assignment.clone(),
            pipeline.clone(),
            collector.clone(),
            gates.clone(),
            cancel.clone(),
            plan.cursor.clone(),
            per_vu_target,
            deadline,
            stages.clone(),
            started,
        ));
    }

    let flush = |collector: &Arc<Mutex<Collector>>, batch_seq: &Arc<AtomicU64>| {
        let (steps, iterations) = collector.lock().unwrap_or_else(PoisonError::into_inner).drain();
        if steps.is_empty() && iterations == 0 {
            return None;
        }
        Some(MetricsReport {
            slave_id: sink.slave_id.clone(),
            execution_id: assignment.execution_id.clone(),
            batch_seq: batch_seq.fetch_add(1, Ordering::SeqCst),
            iterations,
            step_metrics: steps,
            system: None,
            dropped: 0,
            timestamp_ms: now_ms(),
        })
    };

    let progress = |collector: &Arc<Mutex<Collector>>| -> f64 {
        if let Some(target) = plan.target {
            if target == 0 {
                return 1.0;
            }
            let done = {
                let c = collector.lock().unwrap_or_else(PoisonError::into_inner);
                c.iterations
            };
            done as f64 / target as f64
        } else if let Some(total_ms) = plan.deadline_ms {
            if total_ms == 0 {
                return 1.0;
            }
            started.elapsed().as_millis() as f64 / total_ms as f64
        } else {
            0.0
        }
    };

    let mut flush_ticker = tokio::time::interval(Duration::from_millis(1_000));
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut total_done: u64 = 0;

    loop {
        tokio::select! {
            joined = drivers.join_next() => match joined {
                None => break,
                Some(Ok(())) => {}
                Some(Err(e)) => warn!(task_id = %assignment.task_id, error = %e, "driver task failed"),
            },
            _ = flush_ticker.tick() => {
                if let Some(report) = flush(&collector, &batch_seq) {
                    total_done += report.iterations;
                    let _ = sink.metrics.send(report).await;
                }
                let current = progress(&collector);
                send_update(&sink, &assignment, &mut update_seq, TaskStatus::Running, current, Vec::new()).await;
            }
        }
    }

    if let Some(report) = flush(&collector, &batch_seq) {
        total_done += report.iterations;
        let _ = sink.metrics.send(report).await;
    }

    let errors = {
        let mut c = collector.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut c.errors)
    };
    let terminal = if cancel.is_cancelled() {
        TaskStatus::Aborted
    } else {
        TaskStatus::Completed
    };
    debug!(
        task_id = %assignment.task_id,
        iterations = total_done,
        status = %terminal,
        "task finished"
    );
    let final_progress = if terminal == TaskStatus::Completed {
        1.0
    } else {
        progress(&collector)
    };
    send_update(&sink, &assignment, &mut update_seq, terminal, final_progress, errors).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkit::domain::{ExecutionOptions, ExecutionSegment, FailurePolicy, Step, Workflow};
    use flowkit::keyword::KeywordRegistry;
    use flowkit::step::StepExecutors;
    use serde_json::json;

    fn pipeline() -> Arc<StepPipeline> {
        Arc::new(StepPipeline::new(
            Arc::new(KeywordRegistry::with_builtins()),
            Arc::new(StepExecutors::standard()),
        ))
    }

    fn workflow(vus: u32, iterations: u64, mode: ExecutionMode) -> Workflow {
        Workflow {
            id: "w1".to_string(),
            name: "w1".to_string(),
            description: None,
            variables: Default::default(),
            selector: Default::default(),
            options: ExecutionOptions {
                vus,
                iterations,
                execution_mode: mode,
                ..Default::default()
            },
            steps: vec![Step {
                id: "s1".to_string(),
                name: None,
                step_type: "wait".to_string(),
                config: json!({"duration-ms": 1}),
                pre_processors: vec![],
                post_processors: vec![],
                timeout_ms: None,
                on_failure: FailurePolicy::Stop,
            }],
            outputs: vec![],
            thresholds: vec![],
        }
    }

    fn assignment(workflow: Workflow, segment: ExecutionSegment) -> TaskAssignment {
        TaskAssignment {
            task_id: "t1".to_string(),
            execution_id: "e1".to_string(),
            options: workflow.options.clone(),
            workflow,
            segment,
        }
    }

    async fn run(assignment: TaskAssignment) -> (Vec<TaskUpdate>, Vec<MetricsReport>) {
        let (update_tx, mut update_rx) = mpsc::channel(256);
        let (metrics_tx, mut metrics_rx) = mpsc::channel(256);
        let sink = TaskSink {
            slave_id: "slave-1".to_string(),
            updates: update_tx,
            metrics: metrics_tx,
        };
        let (_control, gates) = GateControl::new(64);
        run_task(
            assignment,
            pipeline(),
            sink,
            gates,
            CancellationToken::new(),
            Arc::new(AtomicU64::new(1)),
        )
        .await;

        let mut updates = Vec::new();
        while let Ok(u) = update_rx.try_recv() {
            updates.push(u);
        }
        let mut metrics = Vec::new();
        while let Ok(m) = metrics_rx.try_recv() {
            metrics.push(m);
        }
        (updates, metrics)
    }

    #[tokio::test]
    async fn test_shared_iterations_runs_segment_range() {
        let wf = workflow(4, 20, ExecutionMode::SharedIterations);
        let segment = ExecutionSegment::new(0.0, 0.5).unwrap();
        let (updates, metrics) = run(assignment(wf, segment)).await;

        let iterations: u64 = metrics.iter().map(|m| m.iterations).sum();
        assert_eq!(iterations, 10);

        let last = updates.last().unwrap();
        assert_eq!(last.status, TaskStatus::Completed);
        assert_eq!(last.progress, 1.0);
        // first update announces running
        assert_eq!(updates[0].status, TaskStatus::Running);
        // seqs strictly increase
        for pair in updates.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
    }

    #[tokio::test]
    async fn test_per_vu_iterations() {
        let wf = workflow(2, 3, ExecutionMode::PerVuIterations);
        let (updates, metrics) = run(assignment(wf, ExecutionSegment::full())).await;
        let iterations: u64 = metrics.iter().map(|m| m.iterations).sum();
        // 2 VUs x 3 iterations each
        assert_eq!(iterations, 6);
        assert_eq!(updates.last().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_ramping_runs_for_stage_duration() {
        let mut wf = workflow(4, 0, ExecutionMode::RampingVus);
        wf.options.stages = vec![
            Stage {
                duration_ms: 150,
                target: 2,
                name: "ramp-up".to_string(),
            },
            Stage {
                duration_ms: 150,
                target: 4,
                name: "hold".to_string(),
            },
        ];
        let assignment = assignment(wf, ExecutionSegment::full());

        let start = std::time::Instant::now();
        let (updates, metrics) = run(assignment).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(300), "stages bound the run: {elapsed:?}");
        assert_eq!(updates.last().unwrap().status, TaskStatus::Completed);
        let iterations: u64 = metrics.iter().map(|m| m.iterations).sum();
        assert!(iterations > 0);
    }

    #[tokio::test]
    async fn test_step_metrics_reported() {
        let wf = workflow(1, 5, ExecutionMode::SharedIterations);
        let (_updates, metrics) = run(assignment(wf, ExecutionSegment::full())).await;
        let mut total = StepMetrics::new("s1");
        for report in &metrics {
            for sm in &report.step_metrics {
                assert_eq!(sm.step_id, "s1");
                total.merge(sm);
            }
        }
        assert_eq!(total.count, 5);
        assert_eq!(total.failure_count, 0);
    }

    #[tokio::test]
    async fn test_cancellation_yields_aborted_terminal() {
        let wf = workflow(1, 10_000, ExecutionMode::SharedIterations);
        let assignment = assignment(wf, ExecutionSegment::full());

        let (update_tx, mut update_rx) = mpsc::channel(4096);
        let (metrics_tx, _metrics_rx) = mpsc::channel(4096);
        let sink = TaskSink {
            slave_id: "slave-1".to_string(),
            updates: update_tx,
            metrics: metrics_tx,
        };
        let (_control, gates) = GateControl::new(64);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        run_task(
            assignment,
            pipeline(),
            sink,
            gates,
            cancel,
            Arc::new(AtomicU64::new(1)),
        )
        .await;

        let mut last = None;
        while let Ok(u) = update_rx.try_recv() {
            last = Some(u);
        }
        assert_eq!(last.unwrap().status, TaskStatus::Aborted);
    }

    #[tokio::test]
    async fn test_pause_gates_iterations() {
        let wf = workflow(1, 1_000, ExecutionMode::SharedIterations);
        let assignment = assignment(wf, ExecutionSegment::full());

        let (update_tx, _update_rx) = mpsc::channel(4096);
        let (metrics_tx, mut metrics_rx) = mpsc::channel(4096);
        let sink = TaskSink {
            slave_id: "slave-1".to_string(),
            updates: update_tx,
            metrics: metrics_tx,
        };
        let (control, gates) = GateControl::new(64);
        control.pause();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let task = tokio::spawn(run_task(
            assignment,
            pipeline(),
            sink,
            gates,
            cancel,
            Arc::new(AtomicU64::new(1)),
        ));

        // paused: no iterations happen
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(metrics_rx.try_recv().is_err());

        canceller.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_admit_respects_cap() {
        let (control, gates) = GateControl::new(2);
        let cancel = CancellationToken::new();
        let mut g = gates.clone();
        assert!(g.admit(1, &cancel).await);

        // vu 5 is above the cap; scale up lets it through
        let mut above = gates.clone();
        let admit = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            above.admit(5, &cancel).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!admit.is_finished());
        control.scale(8);
        assert!(admit.await.unwrap());
    }
}
