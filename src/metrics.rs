//! Metrics collection for task queue observability.
//!
//! A pluggable [`MetricsBackend`] with a local in-memory default. The
//! OpenTelemetry backend lives in [`crate::telemetry`] behind the
//! `telemetry` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of recent observations kept per histogram for percentiles
const HISTOGRAM_WINDOW: usize = 4096;

/// A pluggable metrics backend.
///
/// Implement this trait to forward queue metrics to Prometheus,
/// OpenTelemetry or another monitoring system.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Increment a counter metric by the given value
    async fn increment_counter(&self, name: &str, value: u64);

    /// Set a gauge metric to the given value
    async fn set_gauge(&self, name: &str, value: f64);

    /// Record a histogram observation (latencies in milliseconds)
    async fn record_histogram(&self, name: &str, value: f64);

    async fn get_counter(&self, name: &str) -> Option<u64>;

    async fn get_gauge(&self, name: &str) -> Option<f64>;

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats>;

    /// Reset all metrics
    async fn reset(&self);

    /// Export all metrics as a snapshot
    async fn snapshot(&self) -> MetricsSnapshot;
}

/// Statistics for a histogram metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Percentiles over the most recent observations
    pub percentiles: HistogramPercentiles,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Default for HistogramStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HistogramStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            mean: 0.0,
            percentiles: HistogramPercentiles::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct HistogramData {
    window: VecDeque<f64>,
    stats: HistogramStats,
}

impl HistogramData {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(64),
            stats: HistogramStats::new(),
        }
    }

    fn record(&mut self, value: f64) {
        if self.window.len() == HISTOGRAM_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.stats.count += 1;
        self.stats.sum += value;
        self.stats.min = self.stats.min.min(value);
        self.stats.max = self.stats.max.max(value);
        self.stats.mean = self.stats.sum / self.stats.count as f64;
    }

    // percentiles are computed on read, records stay O(1)
    fn stats(&self) -> HistogramStats {
        let mut stats = self.stats.clone();
        if self.window.is_empty() {
            return stats;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        stats.percentiles = HistogramPercentiles {
            p50: Self::percentile(&sorted, 0.50),
            p90: Self::percentile(&sorted, 0.90),
            p95: Self::percentile(&sorted, 0.95),
            p99: Self::percentile(&sorted, 0.99),
        };
        stats
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        let len = sorted.len();
        if len == 0 {
            return 0.0;
        }
        let idx = ((len as f64 * p) as usize).min(len - 1);
        sorted[idx]
    }
}

/// Snapshot of all metrics at a point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramStats>,
}

/// In-memory metrics backend; the default.
pub struct LocalMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, HistogramData>>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for LocalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsBackend for LocalMetrics {
    async fn increment_counter(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    async fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    async fn record_histogram(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write().await;
        histograms
            .entry(name.to_string())
            .or_insert_with(HistogramData::new)
            .record(value);
    }

    async fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters.read().await.get(name).copied()
    }

    async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().await.get(name).copied()
    }

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats> {
        self.histograms.read().await.get(name).map(|h| h.stats())
    }

    async fn reset(&self) {
        self.counters.write().await.clear();
        self.gauges.write().await.clear();
        self.histograms.write().await.clear();
    }

    async fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        MetricsSnapshot {
            counters: counters.clone(),
            gauges: gauges.clone(),
            histograms: histograms
                .iter()
                .map(|(k, v)| (k.clone(), v.stats()))
                .collect(),
        }
    }
}

/// Metric names. Counters and gauges are also recorded per queue as
/// `{name}.{queue}`.
pub mod metric_names {
    /// Counter: tasks enqueued
    pub const TASKS_ENQUEUED: &str = "taskq.tasks.enqueued";
    /// Counter: tasks claimed by a worker
    pub const TASKS_DEQUEUED: &str = "taskq.tasks.dequeued";
    /// Counter: tasks completed successfully
    pub const TASKS_COMPLETED: &str = "taskq.tasks.completed";
    /// Counter: failed attempts (retried or not)
    pub const TASKS_FAILED: &str = "taskq.tasks.failed";
    /// Counter: retries scheduled
    pub const TASKS_RETRIED: &str = "taskq.tasks.retried";
    /// Counter: tasks moved to the dead-letter set
    pub const TASKS_DEAD_LETTERED: &str = "taskq.tasks.dead_lettered";
    /// Counter: claims recovered after the visibility timeout
    pub const TASKS_REAPED: &str = "taskq.tasks.reaped";
    /// Counter: delayed tasks promoted to pending
    pub const TASKS_PROMOTED: &str = "taskq.tasks.promoted";
    /// Counter: claims released without a failure (no handler)
    pub const TASKS_RELEASED: &str = "taskq.tasks.released";
    /// Counter: pending or delayed tasks cancelled
    pub const TASKS_CANCELLED: &str = "taskq.tasks.cancelled";

    /// Gauge: pending tasks across all tiers
    pub const QUEUE_PENDING: &str = "taskq.queue.pending";
    pub const QUEUE_DELAYED: &str = "taskq.queue.delayed";
    pub const QUEUE_PROCESSING: &str = "taskq.queue.processing";
    pub const QUEUE_DEAD_LETTER: &str = "taskq.queue.dead_letter";
    /// Gauge: handlers currently running in this process
    pub const WORKERS_BUSY: &str = "taskq.workers.busy";

    /// Histogram: handler execution time (ms)
    pub const TASK_LATENCY: &str = "taskq.task.latency_ms";
    /// Histogram: time between becoming visible and being claimed (ms)
    pub const TASK_WAIT_TIME: &str = "taskq.task.wait_time_ms";
    /// Histogram: time spent inside a successful `dequeue` call (ms)
    pub const DEQUEUE_LATENCY: &str = "taskq.dequeue.latency_ms";
}

/// Queue-specific recorder over a [`MetricsBackend`]
#[derive(Clone)]
pub struct QueueMetrics {
    backend: Arc<dyn MetricsBackend>,
}

impl QueueMetrics {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Recorder over a fresh [`LocalMetrics`]
    pub fn local() -> Self {
        Self {
            backend: Arc::new(LocalMetrics::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    async fn count(&self, name: &str, queue: &str, value: u64) {
        self.backend.increment_counter(name, value).await;
        self.backend
            .increment_counter(&format!("{}.{}", name, queue), value)
            .await;
    }

    pub async fn record_enqueue(&self, queue: &str) {
        self.count(metric_names::TASKS_ENQUEUED, queue, 1).await;
    }

    /// Record a claim with the time the task waited while visible and the
    /// time the `dequeue` call took
    pub async fn record_dequeue(&self, queue: &str, wait_ms: f64, dequeue_ms: f64) {
        self.count(metric_names::TASKS_DEQUEUED, queue, 1).await;
        self.backend
            .record_histogram(metric_names::TASK_WAIT_TIME, wait_ms)
            .await;
        self.backend
            .record_histogram(metric_names::DEQUEUE_LATENCY, dequeue_ms)
            .await;
    }

    pub async fn record_complete(&self, queue: &str, latency_ms: f64) {
        self.count(metric_names::TASKS_COMPLETED, queue, 1).await;
        self.backend
            .record_histogram(metric_names::TASK_LATENCY, latency_ms)
            .await;
        self.backend
            .record_histogram(
                &format!("{}.{}", metric_names::TASK_LATENCY, queue),
                latency_ms,
            )
            .await;
    }

    pub async fn record_failure(&self, queue: &str) {
        self.count(metric_names::TASKS_FAILED, queue, 1).await;
    }

    pub async fn record_retry(&self, queue: &str) {
        self.count(metric_names::TASKS_RETRIED, queue, 1).await;
    }

    pub async fn record_dead_letter(&self, queue: &str) {
        self.count(metric_names::TASKS_DEAD_LETTERED, queue, 1).await;
    }

    pub async fn record_reap(&self, queue: &str) {
        self.count(metric_names::TASKS_REAPED, queue, 1).await;
    }

    pub async fn record_promote(&self, queue: &str, promoted: usize) {
        if promoted > 0 {
            self.count(metric_names::TASKS_PROMOTED, queue, promoted as u64)
                .await;
        }
    }

    pub async fn record_release(&self, queue: &str) {
        self.count(metric_names::TASKS_RELEASED, queue, 1).await;
    }

    pub async fn record_cancel(&self, queue: &str) {
        self.count(metric_names::TASKS_CANCELLED, queue, 1).await;
    }

    /// Update the per-queue depth gauges
    pub async fn set_queue_depth(
        &self,
        queue: &str,
        pending: usize,
        delayed: usize,
        processing: usize,
        dead_letter: usize,
    ) {
        for (name, value) in [
            (metric_names::QUEUE_PENDING, pending),
            (metric_names::QUEUE_DELAYED, delayed),
            (metric_names::QUEUE_PROCESSING, processing),
            (metric_names::QUEUE_DEAD_LETTER, dead_letter),
        ] {
            self.backend
                .set_gauge(&format!("{}.{}", name, queue), value as f64)
                .await;
        }
    }

    pub async fn set_workers_busy(&self, busy: usize) {
        self.backend
            .set_gauge(metric_names::WORKERS_BUSY, busy as f64)
            .await;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.backend.snapshot().await
    }

    pub async fn reset(&self) {
        self.backend.reset().await;
    }
}
