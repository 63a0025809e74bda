//! Worker pool
//!
//! `concurrency` tokio tasks each loop over dequeue, resolve, execute and
//! record. Handlers run in their own spawned task so a panic or an abort is
//! contained and reported as a failure of that attempt.

use crate::config::WorkerConfig;
use crate::error::{Result, TaskQueueError};
use crate::queue::TaskQueue;
use crate::registry::{HandlerRegistry, TaskContext};
use crate::task::{HandlerError, Task};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long workers get to unwind after their handlers were cancelled
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// State shared by every worker loop of a pool
struct Worker {
    queue: Arc<TaskQueue>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    queues: Vec<String>,
    busy: Arc<AtomicUsize>,
    /// Stop dequeuing
    stop: CancellationToken,
    /// Cancel in-flight handlers
    abort: CancellationToken,
}

/// Bounded pool of task workers
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    worker_handles: Vec<JoinHandle<()>>,
    busy: Arc<AtomicUsize>,
    stop: CancellationToken,
    abort: CancellationToken,
}

impl WorkerPool {
    pub fn new(queue: Arc<TaskQueue>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
            worker_handles: Vec::new(),
            busy: Arc::new(AtomicUsize::new(0)),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Queues the workers dequeue from: the configured list, or every
    /// registered handler name.
    ///
    /// The fallback treats each name as a queue. A handler registered by
    /// task kind (say `"welcome"` for tasks on `"emails"`) needs
    /// [`WorkerConfig::with_queues`] naming `"emails"`, otherwise that
    /// queue is never polled.
    pub fn queues(&self) -> Vec<String> {
        if self.config.queues.is_empty() {
            self.registry.names()
        } else {
            self.config.queues.clone()
        }
    }

    /// Spawn the worker loops.
    ///
    /// Fails when no handler is registered, when concurrency is zero, or
    /// when the pool was already started or shut down.
    pub fn start(&mut self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(TaskQueueError::ConfigError(
                "worker pool started without any registered handler".to_string(),
            ));
        }
        if self.config.concurrency == 0 {
            return Err(TaskQueueError::ConfigError(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if self.stop.is_cancelled() {
            return Err(TaskQueueError::ShutdownInProgress);
        }
        if !self.worker_handles.is_empty() {
            return Err(TaskQueueError::Other("worker pool already started".to_string()));
        }

        if self.config.queues.is_empty() {
            tracing::warn!(
                handlers = ?self.registry.names(),
                "taskq.worker: no queues configured, polling handler names as queues; \
                 handlers keyed by task kind are only reached through configured queues"
            );
        }

        let worker = Arc::new(Worker {
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            queues: self.queues(),
            busy: Arc::clone(&self.busy),
            stop: self.stop.clone(),
            abort: self.abort.clone(),
        });

        for worker_id in 0..self.config.concurrency {
            let worker = Arc::clone(&worker);
            let handle = tokio::spawn(async move { worker.run(worker_id).await });
            self.worker_handles.push(handle);
        }

        tracing::info!(
            concurrency = self.config.concurrency,
            queues = ?worker.queues,
            "taskq.worker: pool started"
        );
        Ok(())
    }

    /// Stop dequeuing, let in-flight handlers finish within `shutdown_grace`,
    /// then cancel and abort whatever is still running.
    ///
    /// Tasks whose handler was cut off stay claimed until the reaper takes
    /// them back.
    pub async fn shutdown(&mut self) {
        self.stop.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let mut handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        for handle in handles.iter_mut() {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                break;
            }
        }

        let unfinished = handles.iter().filter(|h| !h.is_finished()).count();
        if unfinished > 0 {
            tracing::warn!(
                unfinished,
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "taskq.worker: grace period elapsed, cancelling handlers"
            );
        }
        self.abort.cancel();

        for mut handle in handles {
            if tokio::time::timeout(ABORT_WAIT, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
        tracing::info!("taskq.worker: pool stopped");
    }

    /// Check if workers are running
    pub fn is_running(&self) -> bool {
        !self.worker_handles.is_empty() && !self.stop.is_cancelled()
    }

    /// Workers currently executing a task
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Busy workers as a fraction of concurrency
    pub fn utilization(&self) -> f64 {
        if self.config.concurrency == 0 {
            return 0.0;
        }
        self.busy() as f64 / self.config.concurrency as f64
    }
}

impl Worker {
    async fn run(&self, worker_id: usize) {
        tracing::debug!(worker_id, "taskq.worker: loop started");
        let mut store_errors = 0u32;

        while !self.stop.is_cancelled() {
            let claimed = self
                .queue
                .dequeue_until(&self.queues, self.config.wait_timeout, &self.stop)
                .await;

            let task = match claimed {
                Ok(Some(task)) => {
                    store_errors = 0;
                    task
                }
                Ok(None) => continue,
                Err(e) => {
                    store_errors = store_errors.saturating_add(1);
                    let delay = self.config.store_retry.delay_for_attempt(store_errors);
                    tracing::warn!(
                        worker_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "taskq.worker: dequeue failed"
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            let busy = self.busy.fetch_add(1, Ordering::Relaxed) + 1;
            self.report_busy(busy).await;
            self.execute(task).await;
            let busy = self.busy.fetch_sub(1, Ordering::Relaxed) - 1;
            self.report_busy(busy).await;
        }

        tracing::debug!(worker_id, "taskq.worker: loop stopped");
    }

    #[cfg(feature = "metrics")]
    async fn report_busy(&self, busy: usize) {
        if let Some(metrics) = self.queue.metrics() {
            metrics.set_workers_busy(busy).await;
        }
    }

    #[cfg(not(feature = "metrics"))]
    async fn report_busy(&self, _busy: usize) {}

    async fn execute(&self, task: Task) {
        let Some(handler) = self.registry.resolve(&task) else {
            tracing::error!(
                task_id = %task.id,
                queue = %task.queue,
                kind = task.kind.as_deref().unwrap_or(""),
                "taskq.worker: no handler registered, releasing task"
            );
            let delay = self.config.release_delay;
            if let Err(e) = self
                .with_store_retry(&task, || self.queue.release(&task, delay))
                .await
            {
                tracing::warn!(task_id = %task.id, error = %e, "taskq.worker: release failed");
            }
            return;
        };

        let token = self.abort.child_token();
        let ctx = TaskContext::new(task.clone(), token.clone());
        let limit = self.config.handler_timeout;
        let span = tracing::info_span!(
            "taskq.execute",
            task_id = %task.id,
            queue = %task.queue,
            attempt = task.attempt
        );

        let run = async move {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, handler.handle(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(HandlerError::new(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => handler.handle(ctx).await,
            }
        };
        let mut handle = tokio::spawn(run.instrument(span));

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = self.abort.cancelled() => {
                token.cancel();
                handle.abort();
                tracing::warn!(
                    task_id = %task.id,
                    queue = %task.queue,
                    "taskq.worker: handler aborted on shutdown, leaving task for the reaper"
                );
                return;
            }
        };

        match joined {
            Ok(Ok(output)) => {
                if let Err(e) = self
                    .with_store_retry(&task, || self.queue.complete(&task, output.clone()))
                    .await
                {
                    tracing::error!(
                        task_id = %task.id,
                        error = %e,
                        "taskq.worker: could not record completion"
                    );
                }
            }
            Ok(Err(failure)) => self.record_failure(&task, failure).await,
            Err(join) => match panic_failure(join) {
                Some(failure) => self.record_failure(&task, failure).await,
                None => tracing::warn!(task_id = %task.id, "taskq.worker: handler task cancelled"),
            },
        }
    }

    async fn record_failure(&self, task: &Task, failure: HandlerError) {
        tracing::debug!(
            task_id = %task.id,
            queue = %task.queue,
            attempt = task.attempt,
            error = %failure,
            "taskq.worker: handler failed"
        );
        if let Err(e) = self
            .with_store_retry(task, || self.queue.fail(task, failure.clone()))
            .await
        {
            tracing::error!(
                task_id = %task.id,
                error = %e,
                "taskq.worker: could not record failure"
            );
        }
    }

    /// Retry a store call while it reports the store as unavailable
    async fn with_store_retry<T, F, Fut>(&self, task: &Task, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.store_retry;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && policy.should_retry(attempt) => {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        task_id = %task.id,
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "taskq.worker: store call failed, retrying"
                    );
                    tokio::select! {
                        _ = self.abort.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Failure for a handler task that panicked; `None` when it was cancelled
fn panic_failure(err: JoinError) -> Option<HandlerError> {
    if !err.is_panic() {
        return None;
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Some(HandlerError::new(format!("handler panicked: {}", message)))
}
