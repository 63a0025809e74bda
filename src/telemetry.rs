//! OpenTelemetry instrumentation for the task queue.
//!
//! Two entry points:
//!
//! - a global recorder ([`init_taskq_metrics`]) fed directly by queue
//!   transitions, labelled by queue name
//! - [`OtelMetricsBackend`], which plugs the OpenTelemetry meter into
//!   [`crate::metrics::QueueMetrics`]
//!
//! Both use the global meter provider; install one before initializing.

use crate::metrics::{HistogramStats, MetricsBackend, MetricsSnapshot};
use crate::queue::Tally;
use async_trait::async_trait;
use dashmap::DashMap;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

// ============================================================================
// Span and attribute names
// ============================================================================

/// Span around one handler execution
pub const SPAN_EXECUTE: &str = "taskq.execute";

/// Span around one scheduler tick
pub const SPAN_TICK: &str = "taskq.tick";

pub const ATTR_TASK_ID: &str = "taskq.task_id";
pub const ATTR_QUEUE: &str = "taskq.queue";
pub const ATTR_KIND: &str = "taskq.kind";
pub const ATTR_ATTEMPT: &str = "taskq.attempt";

const METER_NAME: &str = "a3s-taskq";

// ============================================================================
// Global recorder
// ============================================================================

static METRICS: OnceLock<TaskqMetricsRecorder> = OnceLock::new();

/// OpenTelemetry instruments for task lifecycle metrics
pub struct TaskqMetricsRecorder {
    pub tasks_enqueued_total: Counter<u64>,
    pub tasks_dequeued_total: Counter<u64>,
    pub tasks_completed_total: Counter<u64>,
    pub tasks_failed_total: Counter<u64>,
    pub tasks_retried_total: Counter<u64>,
    pub tasks_dead_lettered_total: Counter<u64>,
    pub tasks_reaped_total: Counter<u64>,
    /// Handler execution time in seconds
    pub task_duration_seconds: Histogram<f64>,
    /// Time a visible task waited before being claimed, in seconds
    pub task_wait_seconds: Histogram<f64>,
}

/// The global recorder, if [`init_taskq_metrics`] has run
pub fn metrics() -> Option<&'static TaskqMetricsRecorder> {
    METRICS.get()
}

/// Create the global recorder from the global meter provider.
///
/// Only the first call takes effect.
pub fn init_taskq_metrics() {
    let meter = global::meter(METER_NAME);
    let counter = |name: &'static str, description: &'static str| {
        meter.u64_counter(name).with_description(description).init()
    };

    let recorder = TaskqMetricsRecorder {
        tasks_enqueued_total: counter("taskq_tasks_enqueued_total", "Tasks enqueued"),
        tasks_dequeued_total: counter("taskq_tasks_dequeued_total", "Tasks claimed by workers"),
        tasks_completed_total: counter(
            "taskq_tasks_completed_total",
            "Tasks completed successfully",
        ),
        tasks_failed_total: counter("taskq_tasks_failed_total", "Failed task attempts"),
        tasks_retried_total: counter("taskq_tasks_retried_total", "Retries scheduled"),
        tasks_dead_lettered_total: counter(
            "taskq_tasks_dead_lettered_total",
            "Tasks moved to the dead-letter set",
        ),
        tasks_reaped_total: counter(
            "taskq_tasks_reaped_total",
            "Claims recovered after the visibility timeout",
        ),
        task_duration_seconds: meter
            .f64_histogram("taskq_task_duration_seconds")
            .with_description("Handler execution time in seconds")
            .init(),
        task_wait_seconds: meter
            .f64_histogram("taskq_task_wait_seconds")
            .with_description("Time between becoming visible and being claimed")
            .init(),
    };

    let _ = METRICS.set(recorder);
}

fn queue_attr(queue: &str) -> [KeyValue; 1] {
    [KeyValue::new("queue", queue.to_string())]
}

pub fn record_enqueue(queue: &str) {
    if let Some(m) = metrics() {
        m.tasks_enqueued_total.add(1, &queue_attr(queue));
    }
}

pub fn record_dequeue(queue: &str, wait_secs: f64) {
    if let Some(m) = metrics() {
        let attrs = queue_attr(queue);
        m.tasks_dequeued_total.add(1, &attrs);
        m.task_wait_seconds.record(wait_secs, &attrs);
    }
}

pub fn record_complete(queue: &str, duration_secs: f64) {
    if let Some(m) = metrics() {
        let attrs = queue_attr(queue);
        m.tasks_completed_total.add(1, &attrs);
        m.task_duration_seconds.record(duration_secs, &attrs);
    }
}

pub fn record_failure(queue: &str) {
    if let Some(m) = metrics() {
        m.tasks_failed_total.add(1, &queue_attr(queue));
    }
}

pub fn record_retry(queue: &str) {
    if let Some(m) = metrics() {
        m.tasks_retried_total.add(1, &queue_attr(queue));
    }
}

pub fn record_dead_letter(queue: &str) {
    if let Some(m) = metrics() {
        m.tasks_dead_lettered_total.add(1, &queue_attr(queue));
    }
}

pub fn record_reap(queue: &str) {
    if let Some(m) = metrics() {
        m.tasks_reaped_total.add(1, &queue_attr(queue));
    }
}

pub(crate) fn record_tally(queue: &str, tally: Tally) {
    match tally {
        Tally::Enqueued => record_enqueue(queue),
        Tally::Dequeued { wait_ms, .. } => record_dequeue(queue, wait_ms / 1000.0),
        Tally::Completed { latency_ms } => record_complete(queue, latency_ms / 1000.0),
        Tally::Failed => record_failure(queue),
        Tally::Retried => record_retry(queue),
        Tally::DeadLettered => record_dead_letter(queue),
        Tally::Reaped => record_reap(queue),
        Tally::Promoted(_) | Tally::Released | Tally::Cancelled => {}
    }
}

// ============================================================================
// OtelMetricsBackend
// ============================================================================

/// [`MetricsBackend`] over OpenTelemetry instruments.
///
/// Instruments are created lazily per metric name. Gauges are up-down
/// counters fed with the difference from the last value set, so they read
/// as set-to-value. OTLP is push-only: reads return `None` and snapshots
/// are empty.
pub struct OtelMetricsBackend {
    meter: opentelemetry::metrics::Meter,
    counters: DashMap<String, Counter<u64>>,
    histograms: DashMap<String, Histogram<f64>>,
    gauges: DashMap<String, (UpDownCounter<f64>, f64)>,
}

impl OtelMetricsBackend {
    pub fn new() -> Self {
        Self {
            meter: global::meter(METER_NAME),
            counters: DashMap::new(),
            histograms: DashMap::new(),
            gauges: DashMap::new(),
        }
    }

    fn counter(&self, name: &str) -> Counter<u64> {
        if let Some(c) = self.counters.get(name) {
            return c.clone();
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| self.meter.u64_counter(name.to_string()).init())
            .clone()
    }

    fn histogram(&self, name: &str) -> Histogram<f64> {
        if let Some(h) = self.histograms.get(name) {
            return h.clone();
        }
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| self.meter.f64_histogram(name.to_string()).init())
            .clone()
    }
}

impl Default for OtelMetricsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsBackend for OtelMetricsBackend {
    async fn increment_counter(&self, name: &str, value: u64) {
        self.counter(name).add(value, &[]);
    }

    async fn set_gauge(&self, name: &str, value: f64) {
        let mut entry = self.gauges.entry(name.to_string()).or_insert_with(|| {
            (
                self.meter.f64_up_down_counter(name.to_string()).init(),
                0.0,
            )
        });
        let (gauge, last) = entry.value_mut();
        let delta = value - *last;
        if delta != 0.0 {
            gauge.add(delta, &[]);
            *last = value;
        }
    }

    async fn record_histogram(&self, name: &str, value: f64) {
        self.histogram(name).record(value, &[]);
    }

    async fn get_counter(&self, _name: &str) -> Option<u64> {
        None
    }

    async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|entry| entry.value().1)
    }

    async fn get_histogram_stats(&self, _name: &str) -> Option<HistogramStats> {
        None
    }

    async fn reset(&self) {}

    async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
}
