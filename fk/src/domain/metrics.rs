//! Per-step metrics and the duration histogram
//!
//! Duration distributions travel as fixed-boundary histograms with
//! log-spaced buckets from 1 ms to 5 min. Merging across slaves is
//! bucket-wise addition, and percentiles are read from the merged
//! histogram by cumulative-count walk, so `p50 <= p90 <= p95 <= p99`
//! holds by construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Number of histogram buckets
pub const HISTOGRAM_BUCKETS: usize = 40;

/// Upper bound of the last bucket, in milliseconds (5 minutes)
const HISTOGRAM_MAX_MS: f64 = 300_000.0;

fn bucket_bound(index: usize) -> f64 {
    (HISTOGRAM_MAX_MS.ln() * index as f64 / (HISTOGRAM_BUCKETS - 1) as f64).exp()
}

fn bucket_index(ms: f64) -> usize {
    if ms <= 1.0 {
        return 0;
    }
    let idx = (ms.ln() / HISTOGRAM_MAX_MS.ln() * (HISTOGRAM_BUCKETS - 1) as f64).ceil() as usize;
    idx.min(HISTOGRAM_BUCKETS - 1)
}

/// Mergeable duration distribution with exact min/max/avg
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DurationHistogram {
    counts: Vec<u64>,
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            counts: vec![0; HISTOGRAM_BUCKETS],
            count: 0,
            sum_ms: 0.0,
            min_ms: 0.0,
            max_ms: 0.0,
        }
    }
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ms: f64) {
        let ms = ms.max(0.0);
        self.counts[bucket_index(ms)] += 1;
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.sum_ms += ms;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min_ms(&self) -> f64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ms
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum_ms / self.count as f64 }
    }

    /// Percentile estimate in milliseconds, `p` in `(0, 100]`
    ///
    /// Returns the upper bound of the bucket holding the p-th sample,
    /// clamped to the observed min/max.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((p / 100.0) * self.count as f64).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;
        for (i, &c) in self.counts.iter().enumerate() {
            cumulative += c;
            if cumulative >= target {
                return bucket_bound(i).clamp(self.min_ms, self.max_ms);
            }
        }
        self.max_ms
    }

    /// Bucket-wise merge; exact stats combine exactly
    pub fn merge(&mut self, other: &DurationHistogram) {
        if other.count == 0 {
            return;
        }
        for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
            *a += b;
        }
        if self.count == 0 {
            self.min_ms = other.min_ms;
            self.max_ms = other.max_ms;
        } else {
            self.min_ms = self.min_ms.min(other.min_ms);
            self.max_ms = self.max_ms.max(other.max_ms);
        }
        self.count += other.count;
        self.sum_ms += other.sum_ms;
    }
}

/// Metrics for one step on one slave over one report batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepMetrics {
    pub step_id: String,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub duration: DurationHistogram,
    /// Custom metrics merged by key (sum)
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

impl StepMetrics {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            ..Default::default()
        }
    }

    /// Record one step outcome
    pub fn record(&mut self, success: bool, duration_ms: f64) {
        self.count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.duration.record(duration_ms);
    }

    pub fn merge(&mut self, other: &StepMetrics) {
        self.count += other.count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.duration.merge(&other.duration);
        for (k, v) in &other.custom {
            *self.custom.entry(k.clone()).or_default() += v;
        }
    }
}

/// Host-level metrics sampled alongside a report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    /// Live async worker tasks on the slave
    pub worker_tasks: u64,
}

/// One batch of metrics, slave → master
///
/// Batches carry deltas since the previous batch; `batch_seq` increases
/// per slave so the aggregator can drop duplicates under at-least-once
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsReport {
    pub slave_id: String,
    pub execution_id: String,
    pub batch_seq: u64,
    /// Iterations finished in this batch
    pub iterations: u64,
    pub step_metrics: Vec<StepMetrics>,
    #[serde(default)]
    pub system: Option<SystemMetrics>,
    /// Buffered items lost to overflow since the last report
    #[serde(default)]
    pub dropped: u64,
    pub timestamp_ms: i64,
}
