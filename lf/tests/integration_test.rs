//! Integration tests for loadflow
//!
//! These drive the master and slaves end-to-end: standalone execution,
//! distributed segment partitioning over real TCP, stop handling, and
//! rescheduling after a slave loss.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use flowkit::domain::{
    ExecutionMode, ExecutionOptions, ExecutionState, ExecutionStatus, FailurePolicy, MetricsReport, ResourceCaps,
    SlaveInfo, SlaveType, Step, StepMetrics, TaskStatus, TaskUpdate, Threshold, ThresholdOp, Workflow,
};
use flowkit::now_ms;
use loadflow::config::{MasterConfig, SlaveConfig};
use loadflow::master::{MasterHandle, MasterRuntime, SubmitError};
use loadflow::slave::SlaveRuntime;
use loadflow::transport::{Message, SlaveEvent, run_listener};

fn wait_step(id: &str, duration_ms: u64) -> Step {
    Step {
        id: id.to_string(),
        name: None,
        step_type: "wait".to_string(),
        config: serde_json::json!({"duration-ms": duration_ms}),
        pre_processors: vec![],
        post_processors: vec![],
        timeout_ms: None,
        on_failure: FailurePolicy::Stop,
    }
}

fn workflow(id: &str, options: ExecutionOptions, steps: Vec<Step>) -> Workflow {
    Workflow {
        id: id.to_string(),
        name: String::new(),
        description: None,
        variables: HashMap::new(),
        selector: HashMap::new(),
        options,
        steps,
        outputs: vec![],
        thresholds: vec![],
    }
}

fn fast_master_config() -> MasterConfig {
    MasterConfig {
        status_interval_ms: 50,
        sweep_interval_ms: 200,
        heartbeat_timeout_ms: 10_000,
        ..Default::default()
    }
}

/// Metrics may arrive after the terminal task update (stream interleaving
/// is unordered), so totals are asserted by polling.
async fn wait_iterations(handle: &MasterHandle, execution_id: &str, expected: u64, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(metrics) = handle.metrics(execution_id).await
            && metrics.iterations == expected
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {execution_id} never reached {expected} iterations"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_terminal(handle: &MasterHandle, execution_id: &str, timeout: Duration) -> ExecutionState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(state) = handle.execution(execution_id).await
            && state.status.is_terminal()
        {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {execution_id} did not reach a terminal state in {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// =============================================================================
// Standalone execution
// =============================================================================

#[tokio::test]
async fn test_standalone_single_iteration_completes() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let wf = workflow(
        "wf-standalone",
        ExecutionOptions {
            vus: 1,
            iterations: 1,
            standalone: true,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    let execution_id = handle.submit(wf).await.expect("submission accepted");

    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(10)).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.progress, 1.0);

    wait_iterations(&handle, &execution_id, 1, Duration::from_secs(5)).await;
    let metrics = handle.metrics(&execution_id).await.unwrap();
    assert_eq!(metrics.step("s1").unwrap().count, 1);

    let report = handle.report(&execution_id).await.unwrap();
    assert!(report.passed);
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_standalone_pipeline_with_processors() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let mut step = wait_step("s1", 1);
    step.pre_processors = vec![flowkit::domain::Processor {
        keyword: "set_variable".to_string(),
        params: serde_json::json!({"name": "x", "value": "1"}),
    }];
    step.post_processors = vec![flowkit::domain::Processor {
        keyword: "equals".to_string(),
        params: serde_json::json!({"actual": "${x}", "expected": "1"}),
    }];

    let wf = workflow(
        "wf-processors",
        ExecutionOptions {
            vus: 1,
            iterations: 2,
            standalone: true,
            ..Default::default()
        },
        vec![step],
    );
    let execution_id = handle.submit(wf).await.unwrap();
    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(10)).await;
    assert_eq!(state.status, ExecutionStatus::Completed);

    wait_iterations(&handle, &execution_id, 2, Duration::from_secs(5)).await;
    let metrics = handle.metrics(&execution_id).await.unwrap();
    let s1 = metrics.step("s1").unwrap();
    assert_eq!(s1.count, 2);
    assert_eq!(s1.failure_count, 0);
}

#[tokio::test]
async fn test_abort_threshold_fails_execution() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    // the failing pre-processor fails every iteration
    let mut step = wait_step("s1", 1);
    step.pre_processors = vec![flowkit::domain::Processor {
        keyword: "fail".to_string(),
        params: serde_json::json!({"message": "always"}),
    }];

    let mut wf = workflow(
        "wf-thresholds",
        ExecutionOptions {
            vus: 1,
            iterations: 3,
            standalone: true,
            ..Default::default()
        },
        vec![step],
    );
    wf.thresholds = vec![Threshold {
        metric: "s1.error-rate".to_string(),
        op: ThresholdOp::Lt,
        value: 0.5,
        abort_on_fail: true,
    }];

    let execution_id = handle.submit(wf).await.unwrap();
    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(10)).await;
    assert_eq!(state.status, ExecutionStatus::Failed);

    let report = handle.report(&execution_id).await.unwrap();
    assert!(!report.passed);
    assert!(report.abort_failed);
}

#[tokio::test]
async fn test_stop_aborts_standalone_run() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let wf = workflow(
        "wf-stop",
        ExecutionOptions {
            vus: 2,
            duration_ms: 30_000,
            iterations: 0,
            standalone: true,
            ..Default::default()
        },
        vec![wait_step("s1", 10)],
    );
    let execution_id = handle.submit(wf).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.stop(&execution_id).await);

    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(5)).await;
    assert_eq!(state.status, ExecutionStatus::Aborted);

    // metrics stop flowing after the abort (allowing the final in-flight
    // flush to land first)
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after_stop = handle.metrics(&execution_id).await.unwrap().iterations;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.metrics(&execution_id).await.unwrap().iterations, after_stop);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let wf = workflow(
        "wf-pause",
        ExecutionOptions {
            vus: 1,
            iterations: 100_000,
            execution_mode: ExecutionMode::SharedIterations,
            standalone: true,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    let execution_id = handle.submit(wf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(handle.pause(&execution_id).await);
    assert_eq!(
        handle.execution(&execution_id).await.unwrap().status,
        ExecutionStatus::Paused
    );
    // paused: iteration dispatch is gated
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let during_pause = handle.metrics(&execution_id).await.unwrap().iterations;
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let still_paused = handle.metrics(&execution_id).await.unwrap().iterations;
    assert_eq!(during_pause, still_paused);

    assert!(handle.resume(&execution_id).await);
    assert_eq!(
        handle.execution(&execution_id).await.unwrap().status,
        ExecutionStatus::Running
    );

    assert!(handle.stop(&execution_id).await);
    wait_terminal(&handle, &execution_id, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_submission_rejected_without_slaves() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let wf = workflow(
        "wf-no-slaves",
        ExecutionOptions {
            vus: 1,
            iterations: 1,
            standalone: false,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    match handle.submit(wf).await {
        Err(SubmitError::NoEligibleSlaves) => {}
        other => panic!("expected NoEligibleSlaves, got {other:?}"),
    }
}

#[tokio::test]
async fn test_submission_rejects_unknown_keyword() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let mut step = wait_step("s1", 1);
    step.pre_processors = vec![flowkit::domain::Processor {
        keyword: "no_such_keyword".to_string(),
        params: serde_json::json!({}),
    }];
    let wf = workflow(
        "wf-bad-keyword",
        ExecutionOptions {
            standalone: true,
            ..Default::default()
        },
        vec![step],
    );
    match handle.submit(wf).await {
        Err(SubmitError::Validation(_)) => {}
        other => panic!("expected validation error, got {other:?}"),
    }
}

// =============================================================================
// Distributed execution over TCP
// =============================================================================

async fn start_master() -> (MasterHandle, std::sync::Arc<loadflow::SlaveRegistry>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    let registry = runtime.registry();
    tokio::spawn(run_listener(listener, runtime.events_sender()));
    tokio::spawn(runtime.run());
    (handle, registry, addr)
}

fn slave_config(addr: &str, id: &str, max_vus: u32) -> SlaveConfig {
    SlaveConfig {
        master_addr: addr.to_string(),
        id: Some(id.to_string()),
        max_vus,
        heartbeat_interval_ms: 200,
        flush_interval_ms: 50,
        reconnect_initial_ms: 100,
        reconnect_max_ms: 500,
        connect_timeout_ms: 2_000,
        ..Default::default()
    }
}

async fn wait_registered(registry: &loadflow::SlaveRegistry, n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.len() < n {
        assert!(tokio::time::Instant::now() < deadline, "slaves did not register");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_two_slaves_split_shared_iterations() {
    let (handle, registry, addr) = start_master().await;

    let shutdown = CancellationToken::new();
    for (id, max_vus) in [("slave-a", 4), ("slave-b", 6)] {
        let runtime = SlaveRuntime::new(slave_config(&addr, id, max_vus));
        tokio::spawn(runtime.run(shutdown.clone()));
    }
    wait_registered(&registry, 2).await;

    let wf = workflow(
        "wf-distributed",
        ExecutionOptions {
            vus: 10,
            iterations: 100,
            execution_mode: ExecutionMode::SharedIterations,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    let execution_id = handle.submit(wf).await.expect("scheduled onto both slaves");

    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(30)).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.progress, 1.0);

    // the full iteration budget runs exactly once across both workers
    wait_iterations(&handle, &execution_id, 100, Duration::from_secs(10)).await;
    let metrics = handle.metrics(&execution_id).await.unwrap();
    assert_eq!(metrics.step("s1").unwrap().count, 100);
    assert_eq!(metrics.duplicates, 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_slave_shutdown_marks_offline() {
    let (_handle, registry, addr) = start_master().await;

    let shutdown = CancellationToken::new();
    let runtime = SlaveRuntime::new(slave_config(&addr, "slave-x", 4));
    tokio::spawn(runtime.run(shutdown.clone()));
    wait_registered(&registry, 1).await;

    shutdown.cancel();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(entry) = registry.get("slave-x")
            && entry.status.state == flowkit::domain::SlaveState::Offline
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "slave never went offline");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// =============================================================================
// Scripted slaves (event injection): rescheduling and idempotency
// =============================================================================

struct ScriptedSlave {
    id: String,
    epoch: String,
    outbound: mpsc::Receiver<Message>,
    events: mpsc::Sender<SlaveEvent>,
}

impl ScriptedSlave {
    async fn connect(events: &mpsc::Sender<SlaveEvent>, id: &str, max_vus: u32, epoch: &str) -> Self {
        let (out_tx, out_rx) = mpsc::channel(32);
        let (ack_tx, ack_rx) = oneshot::channel();
        events
            .send(SlaveEvent::Connected {
                info: SlaveInfo {
                    id: id.to_string(),
                    slave_type: SlaveType::Worker,
                    address: "scripted".to_string(),
                    capabilities: vec!["wait".to_string(), "http".to_string()],
                    labels: HashMap::new(),
                    caps: ResourceCaps {
                        cpu_cores: 1,
                        memory_mb: 256,
                        max_vus,
                    },
                },
                epoch: epoch.to_string(),
                outbound: out_tx,
                ack: ack_tx,
            })
            .await
            .unwrap();
        let assigned = ack_rx.await.unwrap().expect("registration accepted");
        assert_eq!(assigned, id);
        Self {
            id: id.to_string(),
            epoch: epoch.to_string(),
            outbound: out_rx,
            events: events.clone(),
        }
    }

    async fn expect_assignment(&mut self) -> loadflow::TaskAssignment {
        let deadline = Duration::from_secs(5);
        loop {
            match tokio::time::timeout(deadline, self.outbound.recv())
                .await
                .expect("assignment in time")
                .expect("link open")
            {
                Message::Assign(assignment) => return assignment,
                _ => continue,
            }
        }
    }

    async fn send_update(&self, task: &loadflow::TaskAssignment, seq: u64, status: TaskStatus, progress: f64) {
        self.events
            .send(SlaveEvent::Update(TaskUpdate {
                task_id: task.task_id.clone(),
                execution_id: task.execution_id.clone(),
                slave_id: self.id.clone(),
                seq,
                status,
                progress,
                errors: vec![],
                timestamp_ms: now_ms(),
            }))
            .await
            .unwrap();
    }

    async fn send_metrics(&self, task: &loadflow::TaskAssignment, batch_seq: u64, iterations: u64) {
        let mut step = StepMetrics::new("s1");
        for _ in 0..iterations {
            step.record(true, 5.0);
        }
        self.events
            .send(SlaveEvent::Metrics(MetricsReport {
                slave_id: self.id.clone(),
                execution_id: task.execution_id.clone(),
                batch_seq,
                iterations,
                step_metrics: vec![step],
                system: None,
                dropped: 0,
                timestamp_ms: now_ms(),
            }))
            .await
            .unwrap();
    }

    async fn disconnect(&self) {
        self.events
            .send(SlaveEvent::Disconnected {
                slave_id: self.id.clone(),
                epoch: self.epoch.clone(),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_slave_loss_reschedules_remaining_segment() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    let events = runtime.events_sender();
    tokio::spawn(runtime.run());

    let mut slave_a = ScriptedSlave::connect(&events, "a", 4, "ep-a1").await;
    let mut slave_b = ScriptedSlave::connect(&events, "b", 6, "ep-b1").await;

    let wf = workflow(
        "wf-loss",
        ExecutionOptions {
            vus: 10,
            iterations: 100,
            execution_mode: ExecutionMode::SharedIterations,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    let execution_id = handle.submit(wf).await.unwrap();

    let task_a = slave_a.expect_assignment().await;
    let task_b = slave_b.expect_assignment().await;
    // deterministic split: a (4 VUs) gets [0, 0.4), b (6 VUs) the rest
    assert!((task_a.segment.start - 0.0).abs() < 1e-9 && (task_a.segment.end - 0.4).abs() < 1e-9);
    assert!((task_b.segment.start - 0.4).abs() < 1e-9 && (task_b.segment.end - 1.0).abs() < 1e-9);
    assert_eq!(task_a.segment.iteration_range(100), (0, 40));
    assert_eq!(task_b.segment.iteration_range(100), (40, 100));

    // a runs half its share, reports it, and vanishes
    slave_a.send_update(&task_a, 1, TaskStatus::Running, 0.5).await;
    slave_a.send_metrics(&task_a, 1, 20).await;
    slave_a.disconnect().await;

    // the remaining half of a's segment lands on b
    let reassigned = slave_b.expect_assignment().await;
    assert_eq!(reassigned.execution_id, execution_id);
    assert!((reassigned.segment.start - 0.2).abs() < 1e-6);
    assert!((reassigned.segment.end - 0.4).abs() < 1e-6);

    // b finishes everything
    slave_b.send_metrics(&task_b, 1, 60).await;
    slave_b.send_update(&task_b, 1, TaskStatus::Completed, 1.0).await;
    slave_b.send_metrics(&reassigned, 2, 20).await;
    slave_b.send_update(&reassigned, 1, TaskStatus::Completed, 1.0).await;

    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(5)).await;
    assert_eq!(state.status, ExecutionStatus::Completed);

    // partial results from a are kept and nothing is double-counted
    wait_iterations(&handle, &execution_id, 100, Duration::from_secs(5)).await;
    let metrics = handle.metrics(&execution_id).await.unwrap();
    assert_eq!(metrics.step("s1").unwrap().count, 100);
}

#[tokio::test]
async fn test_duplicate_terminal_update_is_idempotent() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    let events = runtime.events_sender();
    tokio::spawn(runtime.run());

    let mut slave = ScriptedSlave::connect(&events, "solo", 4, "ep-1").await;

    let wf = workflow(
        "wf-idempotent",
        ExecutionOptions {
            vus: 2,
            iterations: 10,
            execution_mode: ExecutionMode::SharedIterations,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    let execution_id = handle.submit(wf).await.unwrap();
    let task = slave.expect_assignment().await;

    slave.send_metrics(&task, 1, 10).await;
    slave.send_update(&task, 2, TaskStatus::Completed, 1.0).await;
    // replayed terminal update and metrics batch (at-least-once delivery)
    slave.send_update(&task, 2, TaskStatus::Completed, 1.0).await;
    slave.send_metrics(&task, 1, 10).await;

    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(5)).await;
    assert_eq!(state.status, ExecutionStatus::Completed);

    wait_iterations(&handle, &execution_id, 10, Duration::from_secs(5)).await;
    let metrics = handle.metrics(&execution_id).await.unwrap();
    assert_eq!(metrics.duplicates, 1);
}

#[tokio::test]
async fn test_busy_rejection_reassigns_elsewhere() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    let events = runtime.events_sender();
    tokio::spawn(runtime.run());

    let mut slave_a = ScriptedSlave::connect(&events, "a", 4, "ep-a").await;
    let mut slave_b = ScriptedSlave::connect(&events, "b", 4, "ep-b").await;

    let wf = workflow(
        "wf-busy",
        ExecutionOptions {
            vus: 8,
            iterations: 8,
            execution_mode: ExecutionMode::SharedIterations,
            ..Default::default()
        },
        vec![wait_step("s1", 1)],
    );
    let execution_id = handle.submit(wf).await.unwrap();

    let task_a = slave_a.expect_assignment().await;
    let task_b = slave_b.expect_assignment().await;

    // a refuses its assignment with a busy error
    events
        .send(SlaveEvent::Update(TaskUpdate {
            task_id: task_a.task_id.clone(),
            execution_id: execution_id.clone(),
            slave_id: "a".to_string(),
            seq: 1,
            status: TaskStatus::Aborted,
            progress: 0.0,
            errors: vec!["slave busy".to_string()],
            timestamp_ms: now_ms(),
        }))
        .await
        .unwrap();

    // the segment moves to b
    let retried = slave_b.expect_assignment().await;
    assert_eq!(retried.segment, task_a.segment);

    slave_b.send_metrics(&task_b, 1, 4).await;
    slave_b.send_update(&task_b, 1, TaskStatus::Completed, 1.0).await;
    slave_b.send_metrics(&retried, 2, 4).await;
    slave_b.send_update(&retried, 1, TaskStatus::Completed, 1.0).await;

    let state = wait_terminal(&handle, &execution_id, Duration::from_secs(5)).await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    wait_iterations(&handle, &execution_id, 8, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_status_stream_publishes_snapshots() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let wf = workflow(
        "wf-status",
        ExecutionOptions {
            vus: 1,
            iterations: 50,
            execution_mode: ExecutionMode::SharedIterations,
            standalone: true,
            ..Default::default()
        },
        vec![wait_step("s1", 2)],
    );
    let execution_id = handle.submit(wf).await.unwrap();
    let mut status = handle.subscribe_status(&execution_id).await.unwrap();

    let mut snapshots = 0;
    loop {
        match status.recv().await {
            Ok(snapshot) => {
                assert_eq!(snapshot.execution_id, execution_id);
                snapshots += 1;
                if snapshot.status.is_terminal() {
                    assert_eq!(snapshot.status, ExecutionStatus::Completed);
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("status stream ended early: {e}"),
        }
    }
    assert!(snapshots >= 2, "expected periodic snapshots, got {snapshots}");
}

#[tokio::test]
async fn test_purge_requires_terminal_state() {
    let runtime = MasterRuntime::new(fast_master_config());
    let handle = runtime.handle();
    tokio::spawn(runtime.run());

    let wf = workflow(
        "wf-purge",
        ExecutionOptions {
            vus: 1,
            duration_ms: 30_000,
            iterations: 0,
            standalone: true,
            ..Default::default()
        },
        vec![wait_step("s1", 5)],
    );
    let execution_id = handle.submit(wf).await.unwrap();

    assert!(!handle.purge(&execution_id).await);
    assert!(handle.stop(&execution_id).await);
    wait_terminal(&handle, &execution_id, Duration::from_secs(5)).await;
    assert!(handle.purge(&execution_id).await);
    assert!(handle.execution(&execution_id).await.is_none());
}
