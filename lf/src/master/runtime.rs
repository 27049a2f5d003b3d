//! MasterRuntime - the control-plane actor
//!
//! One task owns all mutable control-plane state: the execution entries,
//! per-slave outbound links, and task bookkeeping. Admin requests and
//! transport events funnel into its channel; the registry and tracker are
//! shared read-mostly structures for the status surface. Task updates are
//! applied idempotently keyed by `(task id, seq)`, so at-least-once
//! delivery never double-counts a terminal update.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowkit::domain::{
    ExecutionSegment, ExecutionState, ExecutionStatus, SlaveState, TaskResult, TaskStatus, TaskUpdate,
    ValidationError, Workflow,
};
use flowkit::keyword::KeywordRegistry;
use flowkit::pipeline::StepPipeline;
use flowkit::step::StepExecutors;

use super::aggregator::{AggregatorHandle, ExecutionMetrics, FinalReport, spawn_aggregator};
use super::execution::ExecutionTracker;
use super::output::OutputManager;
use super::registry::SlaveRegistry;
use super::scheduler::{ScheduleError, Scheduler};
use super::status::{StatusSnapshot, spawn_status_publisher};
use crate::config::MasterConfig;
use crate::slave::{GateControl, TaskSink, run_task};
use crate::transport::{CommandMessage, CommandType, Message, SlaveEvent, TaskAssignment};

/// Slave id used for standalone (master-local) execution
const LOCAL_SLAVE: &str = "master-local";

/// Why a workflow submission was refused
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("no eligible slaves")]
    NoEligibleSlaves,

    #[error("scheduling failed: {0}")]
    Schedule(String),

    #[error("master unavailable")]
    Unavailable,
}

/// Admin command surface
enum MasterRequest {
    Submit {
        workflow: Workflow,
        reply: oneshot::Sender<Result<String, SubmitError>>,
    },
    Command {
        execution_id: String,
        command: CommandType,
        params: Value,
        reply: oneshot::Sender<bool>,
    },
    GetExecution {
        execution_id: String,
        reply: oneshot::Sender<Option<ExecutionState>>,
    },
    ListExecutions {
        reply: oneshot::Sender<Vec<ExecutionState>>,
    },
    GetMetrics {
        execution_id: String,
        reply: oneshot::Sender<Option<ExecutionMetrics>>,
    },
    GetReport {
        execution_id: String,
        reply: oneshot::Sender<Option<FinalReport>>,
    },
    SubscribeStatus {
        execution_id: String,
        reply: oneshot::Sender<Option<broadcast::Receiver<StatusSnapshot>>>,
    },
    Purge {
        execution_id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle to the master actor
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::Sender<MasterRequest>,
}

impl MasterHandle {
    /// Submit a pre-parsed workflow; returns the execution id
    pub async fn submit(&self, workflow: Workflow) -> Result<String, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::Submit { workflow, reply })
            .await
            .map_err(|_| SubmitError::Unavailable)?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    async fn command(&self, execution_id: &str, command: CommandType, params: Value) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MasterRequest::Command {
                execution_id: execution_id.to_string(),
                command,
                params,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn stop(&self, execution_id: &str) -> bool {
        self.command(execution_id, CommandType::Stop, Value::Null).await
    }

    pub async fn pause(&self, execution_id: &str) -> bool {
        self.command(execution_id, CommandType::Pause, Value::Null).await
    }

    pub async fn resume(&self, execution_id: &str) -> bool {
        self.command(execution_id, CommandType::Resume, Value::Null).await
    }

    pub async fn scale(&self, execution_id: &str, vus: u32) -> bool {
        self.command(execution_id, CommandType::Scale, serde_json::json!({ "vus": vus }))
            .await
    }

    pub async fn execution(&self, execution_id: &str) -> Option<ExecutionState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::GetExecution {
                execution_id: execution_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn list(&self) -> Vec<ExecutionState> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MasterRequest::ListExecutions { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn metrics(&self, execution_id: &str) -> Option<ExecutionMetrics> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::GetMetrics {
                execution_id: execution_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Final report with threshold outcomes; `None` until terminal
    pub async fn report(&self, execution_id: &str) -> Option<FinalReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::GetReport {
                execution_id: execution_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn subscribe_status(&self, execution_id: &str) -> Option<broadcast::Receiver<StatusSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MasterRequest::SubscribeStatus {
                execution_id: execution_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn purge(&self, execution_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(MasterRequest::Purge {
                execution_id: execution_id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(MasterRequest::Shutdown).await;
    }
}

struct TaskRecord {
    slave_id: String,
    epoch: String,
    segment: ExecutionSegment,
    status: TaskStatus,
    progress: f64,
    last_seq: u64,
    errors: Vec<String>,
}

struct ExecutionEntry {
    workflow: Workflow,
    aggregator: AggregatorHandle,
    status_tx: broadcast::Sender<StatusSnapshot>,
    cancel: CancellationToken,
    tasks: HashMap<String, TaskRecord>,
    /// Present for standalone executions: the local pause/scale gates
    local_gates: Option<GateControl>,
    finalized: bool,
}

struct SlaveLink {
    outbound: mpsc::Sender<Message>,
    epoch: String,
}

/// The control-plane actor
pub struct MasterRuntime {
    config: MasterConfig,
    registry: Arc<SlaveRegistry>,
    tracker: ExecutionTracker,
    scheduler: Scheduler,
    pipeline: Arc<StepPipeline>,
    outputs: Arc<OutputManager>,
    rx: mpsc::Receiver<MasterRequest>,
    tx: mpsc::Sender<MasterRequest>,
    events_rx: mpsc::Receiver<SlaveEvent>,
    events_tx: mpsc::Sender<SlaveEvent>,
    executions: HashMap<String, ExecutionEntry>,
    links: HashMap<String, SlaveLink>,
    local_batch_seq: Arc<AtomicU64>,
}

impl MasterRuntime {
    pub fn new(config: MasterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        let (events_tx, events_rx) = mpsc::channel(config.channel_buffer);
        let pipeline = Arc::new(StepPipeline::new(
            Arc::new(KeywordRegistry::with_builtins()),
            Arc::new(StepExecutors::standard()),
        ));
        Self {
            outputs: Arc::new(OutputManager::new(Duration::from_millis(config.output_flush_ms))),
            registry: Arc::new(SlaveRegistry::new()),
            tracker: ExecutionTracker::new(),
            scheduler: Scheduler::new(),
            pipeline,
            rx,
            tx,
            events_rx,
            events_tx,
            executions: HashMap::new(),
            links: HashMap::new(),
            local_batch_seq: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    pub fn handle(&self) -> MasterHandle {
        MasterHandle { tx: self.tx.clone() }
    }

    /// Sender for the transport listener's events
    pub fn events_sender(&self) -> mpsc::Sender<SlaveEvent> {
        self.events_tx.clone()
    }

    pub fn registry(&self) -> Arc<SlaveRegistry> {
        self.registry.clone()
    }

    pub fn outputs(&self) -> Arc<OutputManager> {
        self.outputs.clone()
    }

    /// Run the actor until shutdown
    pub async fn run(mut self) {
        info!("master runtime started");
        if let Err(e) = self.pipeline.executors().init_all().await {
            warn!(error = %e, "executor init failed");
        }
        let _flusher = self.outputs.spawn_flusher();
        let mut sweep = tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(request) = self.rx.recv() => {
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = sweep.tick() => self.sweep().await,
            }
        }

        for entry in self.executions.values() {
            entry.cancel.cancel();
        }
        self.outputs.stop_all().await;
        if let Err(e) = self.pipeline.executors().cleanup_all().await {
            warn!(error = %e, "executor cleanup failed");
        }
        info!("master runtime stopped");
    }

    async fn handle_request(&mut self, request: MasterRequest) -> bool {
        match request {
            MasterRequest::Submit { workflow, reply } => {
                let _ = reply.send(self.submit(workflow).await);
            }
            MasterRequest::Command {
                execution_id,
                command,
                params,
                reply,
            } => {
                let _ = reply.send(self.command(&execution_id, command, params).await);
            }
            MasterRequest::GetExecution { execution_id, reply } => {
                let _ = reply.send(self.tracker.get(&execution_id));
            }
            MasterRequest::ListExecutions { reply } => {
                let _ = reply.send(self.tracker.list());
            }
            MasterRequest::GetMetrics { execution_id, reply } => {
                let metrics = match self.executions.get(&execution_id) {
                    Some(entry) => Some(entry.aggregator.snapshot().await),
                    None => None,
                };
                let _ = reply.send(metrics);
            }
            MasterRequest::GetReport { execution_id, reply } => {
                let report = match (self.tracker.get(&execution_id), self.executions.get(&execution_id)) {
                    (Some(state), Some(entry)) if state.status.is_terminal() => {
                        let mut report = entry.aggregator.finalize(entry.workflow.thresholds.clone()).await;
                        report.tasks = entry
                            .tasks
                            .iter()
                            .map(|(task_id, task)| TaskResult {
                                task_id: task_id.clone(),
                                execution_id: execution_id.clone(),
                                slave_id: task.slave_id.clone(),
                                status: task.status,
                                errors: task.errors.clone(),
                                metrics: None,
                            })
                            .collect();
                        Some(report)
                    }
                    _ => None,
                };
                let _ = reply.send(report);
            }
            MasterRequest::SubscribeStatus { execution_id, reply } => {
                let _ = reply.send(
                    self.executions
                        .get(&execution_id)
                        .map(|entry| entry.status_tx.subscribe()),
                );
            }
            MasterRequest::Purge { execution_id, reply } => {
                let purged = self.tracker.purge(&execution_id);
                if purged {
                    self.executions.remove(&execution_id);
                }
                let _ = reply.send(purged);
            }
            MasterRequest::Shutdown => return false,
        }
        true
    }

    // === submission ===

    async fn submit(&mut self, mut workflow: Workflow) -> Result<String, SubmitError> {
        workflow.apply_defaults();
        let known_types = self.pipeline.executors().type_names();
        let known_keywords = self.pipeline.registry().list(None);
        workflow.validate(&known_types, &known_keywords)?;

        let execution_id = format!("exec-{}", Uuid::now_v7());
        let slaves = self.registry.list();

        match self.scheduler.plan(&workflow, &execution_id, &slaves) {
            Ok(planned) => {
                let mut entry = self.new_entry(&execution_id, workflow.clone(), None);
                let mut active_slaves = Vec::new();

                for plan in planned {
                    match self.place(&workflow, plan.assignment, vec![], Some(plan.slave_id)) {
                        Ok((slave_id, task_id, record)) => {
                            active_slaves.push(slave_id);
                            entry.tasks.insert(task_id, record);
                        }
                        Err(()) => {
                            // roll back whatever was placed
                            for record in entry.tasks.values() {
                                self.send_command(
                                    &record.slave_id,
                                    CommandType::Stop,
                                    Some(execution_id.clone()),
                                    Value::Null,
                                );
                            }
                            return Err(SubmitError::Schedule("no assignment could be placed".to_string()));
                        }
                    }
                }

                self.start_execution(execution_id.clone(), entry, active_slaves);
                Ok(execution_id)
            }
            Err(ScheduleError::NoEligibleSlaves) if workflow.options.standalone => {
                info!(%execution_id, "no slaves eligible, running standalone");
                let mut entry = self.new_entry(&execution_id, workflow.clone(), Some(workflow.options.vus));
                let (task_id, record) = self.spawn_local(&execution_id, &workflow, &entry);
                entry.tasks.insert(task_id, record);
                self.start_execution(execution_id.clone(), entry, vec![LOCAL_SLAVE.to_string()]);
                Ok(execution_id)
            }
            Err(ScheduleError::NoEligibleSlaves) => Err(SubmitError::NoEligibleSlaves),
            Err(e) => Err(SubmitError::Schedule(e.to_string())),
        }
    }

    fn new_entry(&self, execution_id: &str, workflow: Workflow, local_vus: Option<u32>) -> ExecutionEntry {
        let (status_tx, _) = broadcast::channel(64);
        ExecutionEntry {
            aggregator: spawn_aggregator(execution_id.to_string()),
            status_tx,
            cancel: CancellationToken::new(),
            tasks: HashMap::new(),
            local_gates: local_vus.map(|vus| {
                let (control, _gates) = GateControl::new(vus.max(1));
                control
            }),
            finalized: false,
            workflow,
        }
    }

    fn start_execution(&mut self, execution_id: String, entry: ExecutionEntry, active_slaves: Vec<String>) {
        let vus = entry.workflow.options.vus;
        self.tracker
            .insert(ExecutionState::new(execution_id.clone(), entry.workflow.id.clone()));
        self.tracker.set_active_slaves(&execution_id, active_slaves);
        self.tracker.transition(&execution_id, ExecutionStatus::Running);
        spawn_status_publisher(
            execution_id.clone(),
            Duration::from_millis(self.config.status_interval_ms),
            vus,
            self.tracker.clone(),
            entry.aggregator.clone(),
            self.outputs.clone(),
            entry.status_tx.clone(),
        );
        info!(%execution_id, workflow_id = %entry.workflow.id, tasks = entry.tasks.len(), "execution started");
        self.executions.insert(execution_id, entry);
    }

    /// Enqueue an assignment, falling back to the next-best candidate when
    /// the preferred slave's channel is gone
    fn place(
        &self,
        workflow: &Workflow,
        assignment: TaskAssignment,
        mut exclude: Vec<String>,
        preferred: Option<String>,
    ) -> Result<(String, String, TaskRecord), ()> {
        let slaves = self.registry.list();
        let mut candidate = preferred;
        loop {
            let slave_id = match candidate.take() {
                Some(id) => id,
                None => match self.scheduler.reassignment_target(workflow, &slaves, &exclude) {
                    Some(entry) => entry.info.id.clone(),
                    None => return Err(()),
                },
            };
            let Some(link) = self.links.get(&slave_id) else {
                exclude.push(slave_id);
                continue;
            };
            match link.outbound.try_send(Message::Assign(assignment.clone())) {
                Ok(()) => {
                    let record = TaskRecord {
                        slave_id: slave_id.clone(),
                        epoch: link.epoch.clone(),
                        segment: assignment.segment,
                        status: TaskStatus::Assigned,
                        progress: 0.0,
                        last_seq: 0,
                        errors: Vec::new(),
                    };
                    return Ok((slave_id, assignment.task_id, record));
                }
                Err(e) => {
                    warn!(%slave_id, error = %e, "assignment enqueue failed, trying next candidate");
                    exclude.push(slave_id);
                }
            }
        }
    }

    /// Run a task in-process (standalone mode), feeding updates and
    /// metrics back through the event funnel
    fn spawn_local(&self, execution_id: &str, workflow: &Workflow, entry: &ExecutionEntry) -> (String, TaskRecord) {
        let assignment = self
            .scheduler
            .make_task(workflow, execution_id, ExecutionSegment::full());
        let task_id = assignment.task_id.clone();

        let (update_tx, mut update_rx) = mpsc::channel(256);
        let (metrics_tx, mut metrics_rx) = mpsc::channel(256);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                if events.send(SlaveEvent::Update(update)).await.is_err() {
                    break;
                }
            }
        });
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(report) = metrics_rx.recv().await {
                if events.send(SlaveEvent::Metrics(report)).await.is_err() {
                    break;
                }
            }
        });

        let sink = TaskSink {
            slave_id: LOCAL_SLAVE.to_string(),
            updates: update_tx,
            metrics: metrics_tx,
        };
        let gates = entry
            .local_gates
            .as_ref()
            .map(|control| {
                // fresh receiver pair bound to the entry's control
                control.subscribe()
            })
            .unwrap_or_else(|| GateControl::new(workflow.options.vus.max(1)).1);

        tokio::spawn(run_task(
            assignment,
            self.pipeline.clone(),
            sink,
            gates,
            entry.cancel.child_token(),
            self.local_batch_seq.clone(),
        ));

        (
            task_id,
            TaskRecord {
                slave_id: LOCAL_SLAVE.to_string(),
                epoch: "local".to_string(),
                segment: ExecutionSegment::full(),
                status: TaskStatus::Assigned,
                progress: 0.0,
                last_seq: 0,
                errors: Vec::new(),
            },
        )
    }

    // === commands ===

    async fn command(&mut self, execution_id: &str, command: CommandType, params: Value) -> bool {
        let Some(entry) = self.executions.get(execution_id) else {
            return false;
        };

        let transitioned = match command {
            CommandType::Stop => self.tracker.transition(execution_id, ExecutionStatus::Aborted),
            CommandType::Pause => self.tracker.transition(execution_id, ExecutionStatus::Paused),
            CommandType::Resume => self.tracker.transition(execution_id, ExecutionStatus::Running),
            CommandType::Scale => true,
        };
        if !transitioned {
            return false;
        }

        // local (standalone) side
        if command == CommandType::Stop {
            entry.cancel.cancel();
        }
        if let Some(gates) = &entry.local_gates {
            match command {
                CommandType::Pause => gates.pause(),
                CommandType::Resume => gates.resume(),
                CommandType::Scale => {
                    if let Some(vus) = params.get("vus").and_then(Value::as_u64) {
                        gates.scale((vus as u32).max(1));
                    }
                }
                CommandType::Stop => {}
            }
        }

        // fan out to every slave holding tasks of this execution
        let mut slave_ids: Vec<String> = entry
            .tasks
            .values()
            .filter(|t| t.slave_id != LOCAL_SLAVE)
            .map(|t| t.slave_id.clone())
            .collect();
        slave_ids.sort();
        slave_ids.dedup();
        for slave_id in slave_ids {
            self.send_command(&slave_id, command, Some(execution_id.to_string()), params.clone());
        }

        if command == CommandType::Stop
            && let Some(entry) = self.executions.get_mut(execution_id)
        {
            for task in entry.tasks.values_mut() {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Aborted;
                }
            }
        }
        true
    }

    fn send_command(&self, slave_id: &str, command: CommandType, execution_id: Option<String>, params: Value) {
        if let Some(link) = self.links.get(slave_id) {
            let message = Message::Command(CommandMessage {
                command,
                execution_id,
                params,
            });
            if let Err(e) = link.outbound.try_send(message) {
                warn!(%slave_id, error = %e, "command enqueue failed");
            }
        }
    }

    // === transport events ===

    async fn handle_event(&mut self, event: SlaveEvent) {
        match event {
            SlaveEvent::Connected {
                mut info,
                epoch,
                outbound,
                ack,
            } => {
                if info.capabilities.is_empty() {
                    let _ = ack.send(Err("no capabilities advertised".to_string()));
                    return;
                }
                if info.id.is_empty() {
                    info.id = format!("slave-{}", Uuid::now_v7());
                }
                // an id collision with a live connection is a rejection;
                // a reconnect (stale link or offline entry) replaces it
                if let Some(existing) = self.registry.get(&info.id)
                    && existing.status.state != SlaveState::Offline
                    && self.links.contains_key(&info.id)
                    && existing.epoch != epoch
                {
                    let _ = ack.send(Err(format!("slave id {} collides", info.id)));
                    return;
                }

                let slave_id = info.id.clone();
                self.registry.add(info, epoch.clone());
                self.links.insert(
                    slave_id.clone(),
                    SlaveLink {
                        outbound,
                        epoch: epoch.clone(),
                    },
                );
                let _ = ack.send(Ok(slave_id.clone()));

                // a new epoch orphans the previous connection's assignments
                self.abort_stale_epoch_tasks(&slave_id, &epoch).await;
            }
            SlaveEvent::Disconnected { slave_id, epoch } => {
                let current = self.links.get(&slave_id).map(|l| l.epoch.clone());
                if current.as_deref() == Some(epoch.as_str()) {
                    self.links.remove(&slave_id);
                    self.registry.mark_offline(&slave_id);
                    self.handle_slave_loss(&slave_id).await;
                }
            }
            SlaveEvent::Heartbeat { slave_id, status } => {
                self.registry.heartbeat(&slave_id, status);
            }
            SlaveEvent::Update(update) => self.apply_update(update).await,
            SlaveEvent::Metrics(report) => {
                match self.executions.get(&report.execution_id) {
                    Some(entry) => entry.aggregator.report(report).await,
                    None => debug!(execution_id = %report.execution_id, "metrics for unknown execution"),
                }
            }
        }
    }

    /// Idempotent task update application
    async fn apply_update(&mut self, update: TaskUpdate) {
        let execution_id = update.execution_id.clone();
        let Some(entry) = self.executions.get_mut(&execution_id) else {
            debug!(%execution_id, "update for unknown execution");
            return;
        };
        let Some(task) = entry.tasks.get_mut(&update.task_id) else {
            debug!(task_id = %update.task_id, "update for unknown task");
            return;
        };

        // at-least-once: replays and duplicates carry an old seq
        if update.seq <= task.last_seq {
            debug!(task_id = %update.task_id, seq = update.seq, "stale update ignored");
            return;
        }
        task.last_seq = update.seq;
        task.status = update.status;
        task.progress = task.progress.max(update.progress);
        for error in &update.errors {
            if !task.errors.contains(error) {
                task.errors.push(error.clone());
            }
        }

        let busy = update.is_busy_rejection();
        let running = self
            .tracker
            .get(&execution_id)
            .map(|s| s.status == ExecutionStatus::Running)
            .unwrap_or(false);

        if busy && running {
            let segment = task.segment;
            let exclude = vec![task.slave_id.clone()];
            let workflow = entry.workflow.clone();
            let assignment = self.scheduler.make_task(&workflow, &execution_id, segment);
            match self.place(&workflow, assignment, exclude, None) {
                Ok((slave_id, task_id, record)) => {
                    info!(%execution_id, from = %update.slave_id, to = %slave_id, "busy segment reassigned");
                    if let Some(entry) = self.executions.get_mut(&execution_id) {
                        entry.tasks.insert(task_id, record);
                    }
                }
                Err(()) => {
                    self.fail_execution(&execution_id, "busy segment could not be reassigned");
                    return;
                }
            }
        }

        self.refresh_progress(&execution_id);
        self.maybe_complete(&execution_id).await;
    }

    fn refresh_progress(&mut self, execution_id: &str) {
        let Some(entry) = self.executions.get(execution_id) else { return };
        let total = entry.tasks.len();
        if total == 0 {
            return;
        }
        let terminal = entry.tasks.values().filter(|t| t.status.is_terminal()).count();
        let progress = if terminal > 0 {
            terminal as f64 / total as f64
        } else {
            entry
                .tasks
                .values()
                .map(|t| t.progress)
                .fold(0.0f64, f64::max)
        };
        self.tracker.set_progress(execution_id, progress);
    }

    /// Terminal aggregation once every task has finished
    async fn maybe_complete(&mut self, execution_id: &str) {
        let Some(entry) = self.executions.get(execution_id) else { return };
        if entry.finalized || entry.tasks.is_empty() {
            return;
        }
        if !entry.tasks.values().all(|t| t.status.is_terminal()) {
            return;
        }
        let Some(state) = self.tracker.get(execution_id) else { return };
        if state.status.is_terminal() {
            return;
        }
        // tasks can finish while paused; unpause so the terminal
        // transition is reachable
        if state.status == ExecutionStatus::Paused {
            self.tracker.transition(execution_id, ExecutionStatus::Running);
        }

        let thresholds = entry.workflow.thresholds.clone();
        let task_errors: Vec<String> = entry
            .tasks
            .values()
            .flat_map(|t| t.errors.iter().cloned())
            .collect();
        let report = entry.aggregator.finalize(thresholds).await;

        for error in task_errors {
            self.tracker.record_error(execution_id, error);
        }
        let next = if report.abort_failed {
            self.tracker
                .record_error(execution_id, "abort-on-fail threshold failed");
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        self.tracker.set_progress(execution_id, 1.0);
        self.tracker.transition(execution_id, next);
        if let Some(entry) = self.executions.get_mut(execution_id) {
            entry.finalized = true;
        }
        info!(%execution_id, status = %next, "execution finished");
    }

    fn fail_execution(&mut self, execution_id: &str, reason: &str) {
        warn!(%execution_id, %reason, "execution failed");
        self.tracker.record_error(execution_id, reason);
        self.tracker.transition(execution_id, ExecutionStatus::Failed);
        if let Some(entry) = self.executions.get_mut(execution_id) {
            entry.cancel.cancel();
            entry.finalized = true;
            let slave_ids: Vec<String> = entry
                .tasks
                .values()
                .filter(|t| !t.status.is_terminal() && t.slave_id != LOCAL_SLAVE)
                .map(|t| t.slave_id.clone())
                .collect();
            for task in entry.tasks.values_mut() {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Aborted;
                }
            }
            for slave_id in slave_ids {
                self.send_command(&slave_id, CommandType::Stop, Some(execution_id.to_string()), Value::Null);
            }
        }
    }

    /// Mark a lost slave's tasks aborted and reassign what remains
    async fn handle_slave_loss(&mut self, slave_id: &str) {
        // pass 1: abort victims, remember what needs rescheduling
        let mut reschedule: Vec<(String, ExecutionSegment)> = Vec::new();
        for (execution_id, entry) in self.executions.iter_mut() {
            for task in entry.tasks.values_mut() {
                if task.slave_id == slave_id && !task.status.is_terminal() {
                    task.status = TaskStatus::Aborted;
                    task.errors.push("slave offline".to_string());
                    if let Some(remaining) = self.scheduler.remaining_segment(task.segment, task.progress) {
                        reschedule.push((execution_id.clone(), remaining));
                    }
                }
            }
        }

        // pass 2: place remaining segments on surviving slaves
        for (execution_id, segment) in reschedule {
            let running = self
                .tracker
                .get(&execution_id)
                .map(|s| s.status == ExecutionStatus::Running)
                .unwrap_or(false);
            if !running {
                continue;
            }
            let Some(entry) = self.executions.get(&execution_id) else { continue };
            let workflow = entry.workflow.clone();
            let assignment = self.scheduler.make_task(&workflow, &execution_id, segment);
            match self.place(&workflow, assignment, vec![slave_id.to_string()], None) {
                Ok((target, task_id, record)) => {
                    info!(%execution_id, from = %slave_id, to = %target, %segment, "segment rescheduled");
                    if let Some(entry) = self.executions.get_mut(&execution_id) {
                        entry.tasks.insert(task_id, record);
                    }
                }
                Err(()) => {
                    self.fail_execution(&execution_id, "no eligible slaves for reassignment");
                }
            }
        }

        // executions whose only outstanding work was on the lost slave
        let ids: Vec<String> = self.executions.keys().cloned().collect();
        for execution_id in ids {
            self.refresh_progress(&execution_id);
            self.maybe_complete(&execution_id).await;
        }
    }

    /// Abort assignments issued to a previous connection epoch
    async fn abort_stale_epoch_tasks(&mut self, slave_id: &str, current_epoch: &str) {
        let mut stale = false;
        for entry in self.executions.values_mut() {
            for task in entry.tasks.values_mut() {
                if task.slave_id == slave_id && task.epoch != current_epoch && !task.status.is_terminal() {
                    task.status = TaskStatus::Aborted;
                    task.errors.push("slave reconnected with a new epoch".to_string());
                    stale = true;
                }
            }
        }
        if stale {
            // rescheduling reuses the loss path, with the slave back online
            let mut reschedule: Vec<(String, ExecutionSegment)> = Vec::new();
            for (execution_id, entry) in self.executions.iter() {
                for task in entry.tasks.values() {
                    if task.slave_id == slave_id
                        && task.epoch != current_epoch
                        && task.errors.iter().any(|e| e.contains("new epoch"))
                        && task.status == TaskStatus::Aborted
                        && let Some(remaining) = self.scheduler.remaining_segment(task.segment, task.progress)
                    {
                        reschedule.push((execution_id.clone(), remaining));
                    }
                }
            }
            for (execution_id, segment) in reschedule {
                let running = self
                    .tracker
                    .get(&execution_id)
                    .map(|s| s.status == ExecutionStatus::Running)
                    .unwrap_or(false);
                if !running {
                    continue;
                }
                let Some(entry) = self.executions.get(&execution_id) else { continue };
                let workflow = entry.workflow.clone();
                let assignment = self.scheduler.make_task(&workflow, &execution_id, segment);
                if let Ok((target, task_id, record)) = self.place(&workflow, assignment, vec![], None) {
                    info!(%execution_id, to = %target, "stale-epoch segment reassigned");
                    if let Some(entry) = self.executions.get_mut(&execution_id) {
                        entry.tasks.insert(task_id, record);
                    }
                } else {
                    self.fail_execution(&execution_id, "no eligible slaves for reassignment");
                }
            }
        }
    }

    async fn sweep(&mut self) {
        let offline = self.registry.sweep(
            self.config.heartbeat_timeout_ms as i64,
            self.config.lease_ms as i64,
        );
        for slave_id in offline {
            self.links.remove(&slave_id);
            self.handle_slave_loss(&slave_id).await;
        }
    }
}
