//! Queue service: the queue, its scheduler and its worker pool behind one
//! lifecycle

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendConfig, ServiceConfig};
use crate::dlq::DeadLetter;
use crate::error::{Result, TaskQueueError};
use crate::event::{events, EventEmitter, EventStream, QueueEvent};
#[cfg(feature = "metrics")]
use crate::metrics::{metric_names, HistogramStats, MetricsSnapshot, QueueMetrics};
use crate::queue::{QueueDepth, TaskLookup, TaskQueue};
use crate::registry::{HandlerRegistry, TaskContext, TaskHandler};
use crate::scheduler::Scheduler;
use crate::store::{self, MemoryStore, Store};
use crate::task::{EnqueueOptions, HandlerError, TaskId};
use crate::worker::WorkerPool;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Worker load at the time of a health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WorkerHealth {
    pub busy: usize,
    pub total: usize,
    pub utilization: f64,
}

/// Service health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Store reachable and promoter running
    pub healthy: bool,
    pub store_reachable: bool,
    pub backend: &'static str,
    pub promoter_alive: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub workers: WorkerHealth,
    /// Depth of every known queue (empty when the store is unreachable)
    pub queues: BTreeMap<String, QueueDepth>,
    pub dead_letter_total: usize,
}

/// Throughput and latency figures derived from [`QueueMetrics`]
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub uptime_secs: f64,
    /// Tasks enqueued per second since start
    pub enqueue_rate: f64,
    pub retry_rate: f64,
    pub dead_letter_rate: f64,
    pub dequeue_latency_ms: Option<HistogramStats>,
    pub wait_time_ms: Option<HistogramStats>,
    pub task_latency_ms: Option<HistogramStats>,
    pub snapshot: MetricsSnapshot,
}

/// Task queue service
pub struct TaskQueueService {
    config: ServiceConfig,
    queue: Arc<TaskQueue>,
    scheduler: Arc<Scheduler>,
    workers: Mutex<Option<WorkerPool>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    scheduler_shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    created_at: Instant,
}

impl TaskQueueService {
    pub fn builder(config: ServiceConfig) -> TaskQueueServiceBuilder {
        TaskQueueServiceBuilder::new(config)
    }

    /// Start the promoter and, unless this is a producer-only instance, the
    /// worker pool.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.is_shutting_down() {
            return Err(TaskQueueError::ShutdownInProgress.into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("taskq.service: start called twice");
            return Ok(());
        }

        if let Err(e) = self.queue.store().ping().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(anyhow::Error::new(e).context("task store is unreachable"));
        }

        let mut concurrency = 0;
        if let Some(pool) = self.workers.lock().await.as_mut() {
            if let Err(e) = pool.start() {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            concurrency = pool.concurrency();
        }

        let handle = Arc::clone(&self.scheduler).spawn(self.scheduler_shutdown.clone());
        *self.scheduler_handle.lock().await = Some(handle);

        tracing::info!(
            backend = self.queue.store().backend_name(),
            concurrency,
            "taskq.service: started"
        );
        self.queue.events().emit(QueueEvent::with_map(
            events::SERVICE_STARTED,
            [
                (
                    "backend".to_string(),
                    serde_json::json!(self.queue.store().backend_name()),
                ),
                ("concurrency".to_string(), serde_json::json!(concurrency)),
            ]
            .into_iter()
            .collect(),
        ));
        Ok(())
    }

    /// Drain the workers and halt the promoter.
    ///
    /// Later enqueues fail with [`TaskQueueError::ShutdownInProgress`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("taskq.service: stopping");

        if let Some(pool) = self.workers.lock().await.as_mut() {
            pool.shutdown().await;
        }
        self.scheduler_shutdown.cancel();
        if let Some(handle) = self.scheduler_handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "taskq.service: scheduler ended abnormally");
            }
        }

        self.queue
            .events()
            .emit(QueueEvent::empty(events::SERVICE_STOPPED));
        tracing::info!("taskq.service: stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.is_shutting_down()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Get the underlying queue
    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    // ========================================================================
    // Delegates
    // ========================================================================

    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<TaskId> {
        if self.is_shutting_down() {
            return Err(TaskQueueError::ShutdownInProgress);
        }
        self.queue.enqueue(queue, payload, options).await
    }

    pub async fn get_task_status(&self, id: &TaskId) -> Result<TaskLookup> {
        self.queue.get_task_status(id).await
    }

    pub async fn cancel(&self, id: &TaskId) -> Result<bool> {
        self.queue.cancel(id).await
    }

    pub async fn dead_letters(&self, queue: &str, offset: usize, limit: usize) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters(queue, offset, limit).await
    }

    pub async fn requeue_dead_letter(&self, id: &TaskId) -> Result<bool> {
        self.queue.requeue_dead_letter(id).await
    }

    pub async fn purge_dead_letter(&self, id: &TaskId) -> Result<bool> {
        self.queue.purge_dead_letter(id).await
    }

    pub async fn purge_dead_letters(&self, queue: &str) -> Result<usize> {
        self.queue.purge_dead_letters(queue).await
    }

    /// Stream of every queue event
    pub fn subscribe(&self) -> EventStream {
        self.queue.events().subscribe_stream()
    }

    /// Stream of the events of one queue
    pub fn subscribe_queue(&self, queue: impl Into<String>) -> EventStream {
        self.queue.events().subscribe_queue(queue)
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub async fn health(&self) -> HealthReport {
        let store = self.queue.store();
        let store_reachable = match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "taskq.health: store unreachable");
                false
            }
        };

        let workers = match self.workers.lock().await.as_ref() {
            Some(pool) => WorkerHealth {
                busy: pool.busy(),
                total: pool.concurrency(),
                utilization: pool.utilization(),
            },
            None => WorkerHealth::default(),
        };

        let mut queues = BTreeMap::new();
        let mut dead_letter_total = 0;
        if store_reachable {
            match self.queue.queues().await {
                Ok(names) => {
                    for name in names {
                        match self.queue.depth(&name).await {
                            Ok(depth) => {
                                dead_letter_total += depth.dead_letter;
                                queues.insert(name, depth);
                            }
                            Err(e) => tracing::warn!(queue = %name, error = %e, "taskq.health: depth unavailable"),
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "taskq.health: queue list unavailable"),
            }
        }

        let promoter_alive = self.scheduler.is_alive();
        HealthReport {
            healthy: store_reachable && promoter_alive,
            store_reachable,
            backend: store.backend_name(),
            promoter_alive,
            last_tick: self.scheduler.last_tick(),
            workers,
            queues,
            dead_letter_total,
        }
    }

    /// Get the metrics collector (if configured)
    #[cfg(feature = "metrics")]
    pub fn metrics_collector(&self) -> Option<&QueueMetrics> {
        self.queue.metrics()
    }

    /// Rates and histograms since the service was built; `None` without a
    /// metrics collector
    #[cfg(feature = "metrics")]
    pub async fn metrics(&self) -> Option<MetricsReport> {
        let metrics = self.queue.metrics()?;
        let backend = metrics.backend();
        let uptime_secs = self.created_at.elapsed().as_secs_f64();
        let rate = |count: Option<u64>| {
            if uptime_secs > 0.0 {
                count.unwrap_or(0) as f64 / uptime_secs
            } else {
                0.0
            }
        };

        Some(MetricsReport {
            uptime_secs,
            enqueue_rate: rate(backend.get_counter(metric_names::TASKS_ENQUEUED).await),
            retry_rate: rate(backend.get_counter(metric_names::TASKS_RETRIED).await),
            dead_letter_rate: rate(backend.get_counter(metric_names::TASKS_DEAD_LETTERED).await),
            dequeue_latency_ms: backend
                .get_histogram_stats(metric_names::DEQUEUE_LATENCY)
                .await,
            wait_time_ms: backend.get_histogram_stats(metric_names::TASK_WAIT_TIME).await,
            task_latency_ms: backend.get_histogram_stats(metric_names::TASK_LATENCY).await,
            snapshot: metrics.snapshot().await,
        })
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Builder for [`TaskQueueService`]
pub struct TaskQueueServiceBuilder {
    config: ServiceConfig,
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventEmitter>,
    #[cfg(feature = "metrics")]
    metrics: Option<QueueMetrics>,
    registry: HandlerRegistry,
    registration_error: Option<TaskQueueError>,
}

impl TaskQueueServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            events: None,
            #[cfg(feature = "metrics")]
            metrics: None,
            registry: HandlerRegistry::new(),
            registration_error: None,
        }
    }

    /// Use `store` instead of connecting to the configured backend
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_event_emitter(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Add metrics collection
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a handler under a queue name or task kind.
    ///
    /// A duplicate name is reported by [`build`](Self::build).
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        if let Err(e) = self.registry.register(name, handler) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    /// Register an async closure as a handler
    pub fn with_handler_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        if let Err(e) = self.registry.register_fn(name, f) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    /// Replace every registered handler with `registry`
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self.registration_error = None;
        self
    }

    /// Build the queue service
    pub async fn build(self) -> anyhow::Result<TaskQueueService> {
        if let Some(e) = self.registration_error {
            return Err(e.into());
        }
        self.config.validate()?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match (self.store, &self.config.backend) {
            (Some(store), _) => store,
            (None, BackendConfig::Memory) => Arc::new(MemoryStore::with_clock(clock.clone())),
            (None, backend) => store::connect(backend).await?,
        };
        let events = self
            .events
            .unwrap_or_else(|| EventEmitter::new(self.config.event_capacity));

        let queue = TaskQueue::new(store, self.config.queue.clone())
            .with_clock(clock)
            .with_event_emitter(events);
        #[cfg(feature = "metrics")]
        let queue = match self.metrics {
            Some(metrics) => queue.with_metrics(metrics),
            None => queue,
        };
        let queue = Arc::new(queue);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            self.config.scheduler.clone(),
        ));

        let workers = if self.config.workers.enabled {
            Some(WorkerPool::new(
                Arc::clone(&queue),
                self.registry,
                self.config.workers.clone(),
            ))
        } else {
            if !self.registry.is_empty() {
                tracing::warn!(
                    handlers = ?self.registry.names(),
                    "taskq.service: workers disabled, registered handlers will not run"
                );
            }
            None
        };

        tracing::debug!(
            backend = queue.store().backend_name(),
            workers = workers.is_some(),
            "taskq.service: built"
        );

        Ok(TaskQueueService {
            config: self.config,
            queue,
            scheduler,
            workers: Mutex::new(workers),
            scheduler_handle: Mutex::new(None),
            scheduler_shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{SchedulerConfig, WorkerConfig};
    use crate::config::QueueConfig;
    use std::time::Duration;

    fn fast_config() -> ServiceConfig {
        ServiceConfig::default()
            .with_queue(QueueConfig::default().with_poll_interval(Duration::from_millis(5)))
            .with_scheduler(SchedulerConfig::default().with_tick_interval(Duration::from_millis(10)))
            .with_workers(
                WorkerConfig::new(2)
                    .with_wait_timeout(Duration::from_millis(20))
                    .with_shutdown_grace(Duration::from_millis(200)),
            )
    }

    async fn wait_until_finished(service: &TaskQueueService, id: &TaskId) -> TaskLookup {
        for _ in 0..300 {
            let lookup = service.get_task_status(id).await.unwrap();
            if matches!(lookup, TaskLookup::Finished(_)) {
                return lookup;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", id);
    }

    // ========================================================================
    // Builder Tests
    // ========================================================================

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = ServiceConfig::default().with_queue(QueueConfig::default().with_priority_tiers(0));
        assert!(TaskQueueService::builder(config).build().await.is_err());
    }

    #[tokio::test]
    async fn test_build_rejects_duplicate_handler() {
        let result = TaskQueueService::builder(fast_config())
            .with_handler_fn("emails", |_ctx| async { Ok(serde_json::Value::Null) })
            .with_handler_fn("emails", |_ctx| async { Ok(serde_json::Value::Null) })
            .build()
            .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_start_requires_handlers_when_workers_enabled() {
        let service = TaskQueueService::builder(fast_config()).build().await.unwrap();
        assert!(service.start().await.is_err());
        assert!(!service.is_running());
    }

    // ========================================================================
    // Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_end_to_end_processing() {
        let service = TaskQueueService::builder(fast_config())
            .with_handler_fn("greet", |ctx: TaskContext| async move {
                let name = ctx.payload()["name"].as_str().unwrap_or("nobody").to_string();
                Ok(serde_json::json!(format!("hello {}", name)))
            })
            .build()
            .await
            .unwrap();
        let mut events = service.subscribe();
        service.start().await.unwrap();
        assert!(service.is_running());

        let id = service
            .enqueue("greet", serde_json::json!({"name": "ada"}), EnqueueOptions::new())
            .await
            .unwrap();
        let TaskLookup::Finished(result) = wait_until_finished(&service, &id).await else {
            unreachable!()
        };
        assert_eq!(result.output, Some(serde_json::json!("hello ada")));

        let started = events.recv().await.unwrap();
        assert_eq!(started.key, events::SERVICE_STARTED);

        service.stop().await;
        assert!(!service.is_running());
        assert!(matches!(
            service
                .enqueue("greet", serde_json::json!({}), EnqueueOptions::new())
                .await,
            Err(TaskQueueError::ShutdownInProgress)
        ));
        assert!(service.start().await.is_err());
    }

    #[tokio::test]
    async fn test_producer_only_instance() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = fast_config().with_workers(WorkerConfig::default().disabled());
        let service = TaskQueueService::builder(config)
            .with_clock(clock.clone())
            .build()
            .await
            .unwrap();
        service.start().await.unwrap();

        let id = service
            .enqueue(
                "reports",
                serde_json::json!({}),
                EnqueueOptions::new().with_delay(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(31));

        let mut pending = false;
        for _ in 0..100 {
            if matches!(service.get_task_status(&id).await.unwrap(), TaskLookup::Pending(_)) {
                pending = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pending, "promoter should run without workers");
        assert!(service.cancel(&id).await.unwrap());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_dead_letter_administration() {
        let config = fast_config()
            .with_queue(
                QueueConfig::default()
                    .with_max_attempts(1)
                    .with_poll_interval(Duration::from_millis(5)),
            );
        let service = TaskQueueService::builder(config)
            .with_handler_fn("doomed", |_ctx| async { Err(HandlerError::new("nope")) })
            .build()
            .await
            .unwrap();
        service.start().await.unwrap();

        let id = service
            .enqueue("doomed", serde_json::json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        for _ in 0..300 {
            if matches!(
                service.get_task_status(&id).await.unwrap(),
                TaskLookup::DeadLettered(_)
            ) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        service.stop().await;

        let letters = service.dead_letters("doomed", 0, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_id, id);
        assert_eq!(service.purge_dead_letters("doomed").await.unwrap(), 1);
    }

    // ========================================================================
    // Observability Tests
    // ========================================================================

    #[tokio::test]
    async fn test_health_report() {
        let config = fast_config().with_workers(WorkerConfig::default().disabled());
        let service = TaskQueueService::builder(config).build().await.unwrap();

        let before = service.health().await;
        assert!(before.store_reachable);
        assert!(!before.promoter_alive);
        assert!(!before.healthy);
        assert_eq!(before.backend, "memory");

        service
            .enqueue("emails", serde_json::json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        service.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = service.health().await;
        assert!(report.healthy);
        assert!(report.promoter_alive);
        assert_eq!(report.workers, WorkerHealth::default());
        assert_eq!(report.queues["emails"].total_pending(), 1);
        assert_eq!(report.dead_letter_total, 0);
        service.stop().await;
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_report() {
        let config = fast_config().with_workers(WorkerConfig::default().disabled());
        let service = TaskQueueService::builder(config)
            .with_metrics(QueueMetrics::local())
            .build()
            .await
            .unwrap();
        for _ in 0..4 {
            service
                .enqueue("emails", serde_json::json!({}), EnqueueOptions::new())
                .await
                .unwrap();
        }
        service.queue().try_dequeue(&["emails"]).await.unwrap().unwrap();

        let report = service.metrics().await.unwrap();
        assert!(report.enqueue_rate > 0.0);
        assert_eq!(report.retry_rate, 0.0);
        assert_eq!(report.dequeue_latency_ms.unwrap().count, 1);
        assert_eq!(report.wait_time_ms.unwrap().count, 1);
        assert_eq!(
            report.snapshot.counters.get(metric_names::TASKS_ENQUEUED),
            Some(&4)
        );
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_report_absent_without_collector() {
        let service = TaskQueueService::builder(ServiceConfig::default())
            .build()
            .await
            .unwrap();
        assert!(service.metrics().await.is_none());
        assert!(service.metrics_collector().is_none());
    }
}
