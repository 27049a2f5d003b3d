//! SlaveRuntime - connection lifecycle, admission, and the command plane
//!
//! The runtime owns the transport client, a bounded worker pool, and the
//! update/metrics buffers. Running tasks survive disconnects: buffers
//! hold their emissions and replay once a new connection registers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowkit::domain::{MetricsReport, ResourceCaps, SlaveInfo, SlaveState, SlaveStatus, SlaveType, TaskStatus, TaskUpdate};
use flowkit::keyword::KeywordRegistry;
use flowkit::now_ms;
use flowkit::pipeline::StepPipeline;
use flowkit::step::StepExecutors;

use super::buffer::BoundedBuffer;
use super::worker::{GateControl, Gates, TaskSink, run_task};
use crate::config::SlaveConfig;
use crate::supervisor::spawn_supervised;
use crate::transport::{Backoff, CommandMessage, CommandType, Connection, Message, TaskAssignment, TransportError};

type ExecCancels = Arc<Mutex<HashMap<String, (CancellationToken, usize)>>>;

/// A long-lived worker process
pub struct SlaveRuntime {
    config: SlaveConfig,
    info: SlaveInfo,
    pipeline: Arc<StepPipeline>,
    updates: Arc<BoundedBuffer<TaskUpdate>>,
    metrics: Arc<BoundedBuffer<MetricsReport>>,
    batch_seq: Arc<AtomicU64>,
    gate_control: GateControl,
    gates: Gates,
    active_vus: Arc<AtomicU32>,
    active_tasks: Arc<AtomicU32>,
    exec_cancels: ExecCancels,
    root_cancel: CancellationToken,
}

impl SlaveRuntime {
    pub fn new(config: SlaveConfig) -> Self {
        let executors = StepExecutors::standard();
        let capabilities = executors.type_names();
        let id = config
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("slave-{}", Uuid::now_v7()));
        let address = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        let info = SlaveInfo {
            id,
            slave_type: SlaveType::Worker,
            address,
            capabilities,
            labels: config.labels.clone(),
            caps: ResourceCaps {
                cpu_cores: config.cpu_cores,
                memory_mb: config.memory_mb,
                max_vus: config.max_vus,
            },
        };

        let pipeline = Arc::new(StepPipeline::new(
            Arc::new(KeywordRegistry::with_builtins()),
            Arc::new(executors),
        ));
        let (gate_control, gates) = GateControl::new(config.max_vus);

        Self {
            updates: Arc::new(BoundedBuffer::new(config.buffer_capacity)),
            metrics: Arc::new(BoundedBuffer::new(config.buffer_capacity)),
            batch_seq: Arc::new(AtomicU64::new(1)),
            gate_control,
            gates,
            active_vus: Arc::new(AtomicU32::new(0)),
            active_tasks: Arc::new(AtomicU32::new(0)),
            exec_cancels: Arc::new(Mutex::new(HashMap::new())),
            root_cancel: CancellationToken::new(),
            info,
            pipeline,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Connect-register-serve loop with exponential backoff between
    /// attempts; returns once `shutdown` fires or the attempt budget is
    /// spent.
    pub async fn run(mut self, shutdown: CancellationToken) -> eyre::Result<()> {
        info!(slave_id = %self.info.id, master = %self.config.master_addr, "slave starting");
        self.pipeline.executors().init_all().await?;

        // workers emit through these; a pump keeps buffering even while
        // disconnected
        let (update_tx, mut update_rx) = mpsc::channel::<TaskUpdate>(1024);
        let (metrics_tx, mut metrics_rx) = mpsc::channel::<MetricsReport>(1024);
        let sink = TaskSink {
            slave_id: self.info.id.clone(),
            updates: update_tx,
            metrics: metrics_tx,
        };
        {
            let updates = self.updates.clone();
            tokio::spawn(async move {
                while let Some(update) = update_rx.recv().await {
                    updates.push(update);
                }
            });
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                while let Some(report) = metrics_rx.recv().await {
                    metrics.push(report);
                }
            });
        }

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_initial_ms),
            Duration::from_millis(self.config.reconnect_max_ms),
            self.config.reconnect_max_attempts,
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match Connection::connect(
                &self.config.master_addr,
                &self.info,
                Duration::from_millis(self.config.connect_timeout_ms),
            )
            .await
            {
                Ok(connection) => {
                    info!(slave_id = %connection.assigned_id, "connected to master");
                    self.info.id = connection.assigned_id.clone();
                    backoff.reset();
                    self.session(connection, &sink, &shutdown).await;
                    warn!("disconnected from master");
                    // the master marks this epoch's assignments aborted and
                    // reschedules them, so in-flight work stops here too
                    self.cancel_all_tasks();
                }
                Err(e) => {
                    warn!(error = %e, "connect failed");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            let Some(delay) = backoff.next_delay() else {
                self.root_cancel.cancel();
                return Err(TransportError::ReconnectExhausted.into());
            };
            debug!(?delay, "reconnecting after backoff");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break,
            }
        }

        // graceful shutdown: abort in-flight work
        self.root_cancel.cancel();
        if let Err(e) = self.pipeline.executors().cleanup_all().await {
            warn!(error = %e, "executor cleanup failed");
        }
        Ok(())
    }

    /// One connected phase; returns when the connection dies
    async fn session(&self, mut connection: Connection, sink: &TaskSink, shutdown: &CancellationToken) {
        let session_cancel = CancellationToken::new();

        // heartbeat sender
        {
            let outbound = connection.outbound.clone();
            let slave_id = self.info.id.clone();
            let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
            let active_vus = self.active_vus.clone();
            let active_tasks = self.active_tasks.clone();
            let max_vus = self.config.max_vus.max(1);
            let cancel = session_cancel.clone();
            let draining = shutdown.clone();
            spawn_supervised(
                "heartbeat",
                move || {
                    let outbound = outbound.clone();
                    let slave_id = slave_id.clone();
                    let active_vus = active_vus.clone();
                    let active_tasks = active_tasks.clone();
                    let cancel = cancel.clone();
                    let draining = draining.clone();
                    async move {
                        let mut ticker = tokio::time::interval(interval);
                        loop {
                            tokio::select! {
                                _ = ticker.tick() => {}
                                () = cancel.cancelled() => return,
                            }
                            let vus = active_vus.load(Ordering::Relaxed);
                            let state = if draining.is_cancelled() {
                                SlaveState::Draining
                            } else if vus >= max_vus {
                                SlaveState::Busy
                            } else {
                                SlaveState::Online
                            };
                            let status = SlaveStatus {
                                state,
                                load: f64::from(vus) / f64::from(max_vus),
                                active_tasks: active_tasks.load(Ordering::Relaxed),
                                last_seen_ms: now_ms(),
                            };
                            if outbound
                                .send(Message::Heartbeat {
                                    slave_id: slave_id.clone(),
                                    status,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                },
                3,
                |message| warn!("{message}"),
            );
        }

        // buffer flusher: updates first (FIFO), then metrics batches
        {
            let outbound = connection.outbound.clone();
            let updates = self.updates.clone();
            let metrics = self.metrics.clone();
            let interval = Duration::from_millis(self.config.flush_interval_ms);
            let cancel = session_cancel.clone();
            spawn_supervised(
                "flusher",
                move || {
                    let outbound = outbound.clone();
                    let updates = updates.clone();
                    let metrics = metrics.clone();
                    let cancel = cancel.clone();
                    async move {
                        let mut ticker = tokio::time::interval(interval);
                        loop {
                            tokio::select! {
                                _ = ticker.tick() => {}
                                () = cancel.cancelled() => return,
                            }
                            for update in updates.drain(usize::MAX) {
                                if let Err(e) = outbound.try_send(Message::Update(update.clone())) {
                                    debug!(error = %e, "update flush stalled, requeueing");
                                    updates.requeue_front(vec![update]);
                                    break;
                                }
                            }
                            let mut reports = metrics.drain(usize::MAX);
                            if let Some(first) = reports.first_mut() {
                                // overflow losses ride on the next batch out
                                first.dropped += updates.take_dropped() + metrics.take_dropped();
                            }
                            for report in reports {
                                if let Err(e) = outbound.try_send(Message::Metrics(report.clone())) {
                                    debug!(error = %e, "metrics flush stalled, requeueing");
                                    metrics.requeue_front(vec![report]);
                                    break;
                                }
                            }
                        }
                    }
                },
                3,
                |message| warn!("{message}"),
            );
        }

        loop {
            tokio::select! {
                message = connection.inbound.recv() => match message {
                    Some(Message::Assign(assignment)) => self.handle_assignment(assignment, sink),
                    Some(Message::Command(command)) => self.handle_command(command),
                    Some(other) => warn!(kind = other.kind(), "unexpected message from master"),
                    None => break,
                },
                () = shutdown.cancelled() => break,
            }
        }

        session_cancel.cancel();
    }

    /// Admission check plus worker spawn
    fn handle_assignment(&self, assignment: TaskAssignment, sink: &TaskSink) {
        let task_vus = assignment.segment.vus_of(assignment.options.vus).max(1);
        let cap = self.gate_control.cap() + self.config.admission_buffer;
        let current = self.active_vus.load(Ordering::SeqCst);
        if current + task_vus > cap {
            warn!(
                task_id = %assignment.task_id,
                current,
                task_vus,
                cap,
                "rejecting assignment, slave busy"
            );
            self.updates.push(TaskUpdate {
                task_id: assignment.task_id.clone(),
                execution_id: assignment.execution_id.clone(),
                slave_id: self.info.id.clone(),
                seq: 1,
                status: TaskStatus::Aborted,
                progress: 0.0,
                errors: vec!["slave busy".to_string()],
                timestamp_ms: now_ms(),
            });
            return;
        }

        info!(
            task_id = %assignment.task_id,
            execution_id = %assignment.execution_id,
            segment = %assignment.segment,
            vus = task_vus,
            "task accepted"
        );
        self.active_vus.fetch_add(task_vus, Ordering::SeqCst);
        self.active_tasks.fetch_add(1, Ordering::SeqCst);

        let cancel = {
            let mut cancels = self.exec_cancels.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = cancels
                .entry(assignment.execution_id.clone())
                .or_insert_with(|| (self.root_cancel.child_token(), 0));
            // a token spent by a disconnect must not abort fresh work
            if entry.0.is_cancelled() {
                entry.0 = self.root_cancel.child_token();
            }
            entry.1 += 1;
            entry.0.clone()
        };

        let worker = tokio::spawn(run_task(
            assignment.clone(),
            self.pipeline.clone(),
            sink.clone(),
            self.gates.clone(),
            cancel,
            self.batch_seq.clone(),
        ));

        // monitor: fail the task cleanly if the worker dies, then release
        // its slots
        let updates = self.updates.clone();
        let active_vus = self.active_vus.clone();
        let active_tasks = self.active_tasks.clone();
        let exec_cancels = self.exec_cancels.clone();
        let slave_id = self.info.id.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.await
                && e.is_panic()
            {
                warn!(task_id = %assignment.task_id, error = %e, "task worker panicked");
                updates.push(TaskUpdate {
                    task_id: assignment.task_id.clone(),
                    execution_id: assignment.execution_id.clone(),
                    slave_id,
                    seq: u64::MAX,
                    status: TaskStatus::Failed,
                    progress: 0.0,
                    errors: vec![format!("worker panicked: {e}")],
                    timestamp_ms: now_ms(),
                });
            }
            active_vus.fetch_sub(task_vus, Ordering::SeqCst);
            active_tasks.fetch_sub(1, Ordering::SeqCst);
            let mut cancels = exec_cancels.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cancels.get_mut(&assignment.execution_id) {
                entry.1 -= 1;
                if entry.1 == 0 {
                    cancels.remove(&assignment.execution_id);
                }
            }
        });
    }

    fn cancel_all_tasks(&self) {
        let cancels = self.exec_cancels.lock().unwrap_or_else(PoisonError::into_inner);
        for (token, _) in cancels.values() {
            token.cancel();
        }
    }

    fn handle_command(&self, command: CommandMessage) {
        info!(command = ?command.command, execution_id = ?command.execution_id, "command received");
        match command.command {
            CommandType::Stop => {
                let cancels = self.exec_cancels.lock().unwrap_or_else(PoisonError::into_inner);
                match &command.execution_id {
                    Some(execution_id) => {
                        if let Some((token, _)) = cancels.get(execution_id) {
                            token.cancel();
                        }
                    }
                    None => {
                        for (token, _) in cancels.values() {
                            token.cancel();
                        }
                    }
                }
            }
            CommandType::Pause => self.gate_control.pause(),
            CommandType::Resume => self.gate_control.resume(),
            CommandType::Scale => {
                let requested = command.params.get("vus").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                let cap = requested.clamp(1, self.config.max_vus);
                info!(requested, cap, "scaling effective vu cap");
                self.gate_control.scale(cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assigns_id_and_capabilities() {
        let runtime = SlaveRuntime::new(SlaveConfig::default());
        assert!(runtime.id().starts_with("slave-"));
        assert!(runtime.info.capabilities.contains(&"http".to_string()));
        assert!(runtime.info.capabilities.contains(&"wait".to_string()));
    }

    #[test]
    fn test_configured_id_wins() {
        let config = SlaveConfig {
            id: Some("worker-7".to_string()),
            ..Default::default()
        };
        let runtime = SlaveRuntime::new(config);
        assert_eq!(runtime.id(), "worker-7");
    }

    #[test]
    fn test_scale_command_clamps_to_max_vus() {
        let config = SlaveConfig {
            max_vus: 8,
            ..Default::default()
        };
        let runtime = SlaveRuntime::new(config);
        runtime.handle_command(CommandMessage {
            command: CommandType::Scale,
            execution_id: None,
            params: serde_json::json!({"vus": 100}),
        });
        assert_eq!(runtime.gate_control.cap(), 8);

        runtime.handle_command(CommandMessage {
            command: CommandType::Scale,
            execution_id: None,
            params: serde_json::json!({"vus": 3}),
        });
        assert_eq!(runtime.gate_control.cap(), 3);
    }

    #[tokio::test]
    async fn test_busy_rejection_pushes_aborted_update() {
        let config = SlaveConfig {
            max_vus: 2,
            admission_buffer: 0,
            ..Default::default()
        };
        let runtime = SlaveRuntime::new(config);
        runtime.active_vus.store(2, Ordering::SeqCst);

        let (update_tx, _update_rx) = mpsc::channel(8);
        let (metrics_tx, _metrics_rx) = mpsc::channel(8);
        let sink = TaskSink {
            slave_id: runtime.id().to_string(),
            updates: update_tx,
            metrics: metrics_tx,
        };

        let workflow = flowkit::domain::Workflow {
            id: "w1".to_string(),
            name: "w1".to_string(),
            description: None,
            variables: Default::default(),
            selector: Default::default(),
            options: flowkit::domain::ExecutionOptions {
                vus: 4,
                iterations: 10,
                ..Default::default()
            },
            steps: vec![],
            outputs: vec![],
            thresholds: vec![],
        };
        runtime.handle_assignment(
            TaskAssignment {
                task_id: "t1".to_string(),
                execution_id: "e1".to_string(),
                options: workflow.options.clone(),
                workflow,
                segment: flowkit::domain::ExecutionSegment::full(),
            },
            &sink,
        );

        let rejected = runtime.updates.drain(10);
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].is_busy_rejection());
    }
}
