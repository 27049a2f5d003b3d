//! Output plugin surface
//!
//! Concrete sinks (InfluxDB, Kafka, consoles) live outside the engine;
//! they plug in behind [`Output`]. The manager batches aggregated samples
//! and fans every batch to every registered output on a flush cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use flowkit::domain::ExecutionStatus;

use super::aggregator::StepSummary;

/// One batch of aggregated samples for one execution
#[derive(Debug, Clone)]
pub struct SampleContainer {
    pub execution_id: String,
    pub timestamp_ms: i64,
    pub steps: Vec<StepSummary>,
}

/// A pluggable metrics sink
#[async_trait]
pub trait Output: Send + Sync {
    fn description(&self) -> String;

    async fn start(&self) -> eyre::Result<()>;

    async fn add_metric_samples(&self, containers: &[SampleContainer]);

    async fn set_run_status(&self, status: ExecutionStatus);

    async fn stop(&self) -> eyre::Result<()>;
}

/// Fans sample batches out to every registered output
pub struct OutputManager {
    outputs: Mutex<Vec<Arc<dyn Output>>>,
    buffer: Mutex<Vec<SampleContainer>>,
    flush_interval: Duration,
}

impl OutputManager {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            outputs: Mutex::new(Vec::new()),
            buffer: Mutex::new(Vec::new()),
            flush_interval,
        }
    }

    pub async fn register(&self, output: Arc<dyn Output>) -> eyre::Result<()> {
        info!(output = %output.description(), "output registered");
        output.start().await?;
        self.outputs.lock().await.push(output);
        Ok(())
    }

    /// Queue a batch; the flusher delivers it
    pub async fn add_samples(&self, container: SampleContainer) {
        self.buffer.lock().await.push(container);
    }

    pub async fn set_run_status(&self, status: ExecutionStatus) {
        for output in self.outputs.lock().await.iter() {
            output.set_run_status(status).await;
        }
    }

    async fn flush(&self) {
        let batch: Vec<SampleContainer> = std::mem::take(&mut *self.buffer.lock().await);
        if batch.is_empty() {
            return;
        }
        for output in self.outputs.lock().await.iter() {
            output.add_metric_samples(&batch).await;
        }
    }

    /// Run the flush loop; ends when the manager is dropped elsewhere
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = self.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.flush().await;
            }
        })
    }

    pub async fn stop_all(&self) {
        self.flush().await;
        for output in self.outputs.lock().await.iter() {
            if let Err(e) = output.stop().await {
                debug!(error = %e, "output stop failed");
            }
        }
    }
}

/// Tracing-backed sink, the only in-tree output
pub struct LogOutput;

#[async_trait]
impl Output for LogOutput {
    fn description(&self) -> String {
        "log".to_string()
    }

    async fn start(&self) -> eyre::Result<()> {
        Ok(())
    }

    async fn add_metric_samples(&self, containers: &[SampleContainer]) {
        for container in containers {
            for step in &container.steps {
                debug!(
                    target: "output",
                    execution_id = %container.execution_id,
                    step_id = %step.step_id,
                    count = step.count,
                    failures = step.failure_count,
                    avg_ms = step.avg_ms,
                    p95_ms = step.p95_ms,
                    "sample"
                );
            }
        }
    }

    async fn set_run_status(&self, status: ExecutionStatus) {
        info!(target: "output", %status, "run status");
    }

    async fn stop(&self) -> eyre::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        samples: AtomicUsize,
        statuses: AtomicUsize,
    }

    #[async_trait]
    impl Output for Counting {
        fn description(&self) -> String {
            "counting".to_string()
        }
        async fn start(&self) -> eyre::Result<()> {
            Ok(())
        }
        async fn add_metric_samples(&self, containers: &[SampleContainer]) {
            self.samples.fetch_add(containers.len(), Ordering::SeqCst);
        }
        async fn set_run_status(&self, _status: ExecutionStatus) {
            self.statuses.fetch_add(1, Ordering::SeqCst);
        }
        async fn stop(&self) -> eyre::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_manager_fans_out_batches() {
        let manager = Arc::new(OutputManager::new(Duration::from_millis(10)));
        let output = Arc::new(Counting {
            samples: AtomicUsize::new(0),
            statuses: AtomicUsize::new(0),
        });
        manager.register(output.clone()).await.unwrap();
        let _flusher = manager.spawn_flusher();

        for _ in 0..3 {
            manager
                .add_samples(SampleContainer {
                    execution_id: "e1".to_string(),
                    timestamp_ms: 0,
                    steps: Vec::new(),
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(output.samples.load(Ordering::SeqCst), 3);

        manager.set_run_status(ExecutionStatus::Completed).await;
        assert_eq!(output.statuses.load(Ordering::SeqCst), 1);
    }
}
