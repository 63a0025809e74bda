//! Queue operations over a shared [`Store`]
//!
//! Each named queue is laid out as `priority_tiers` pending sets, one delayed
//! set, one processing set and one dead-letter set. A task sits in exactly
//! one of them until it reaches a terminal result. Every transition below is
//! a single store primitive, so any number of `TaskQueue` instances (in any
//! number of processes) can share one store.
//!
//! Transitions out of the processing set are fenced on the claim deadline:
//! once the reaper has taken a task back, the original claimant's `fail` is
//! reported as [`FailOutcome::Stale`]. A late `complete` still wins and is
//! reported as [`Completion::Late`].

use crate::clock::{from_score, offset, rewind, score_of, Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{Result, TaskQueueError};
use crate::event::{events, EventEmitter, QueueEvent};
#[cfg(feature = "metrics")]
use crate::metrics::QueueMetrics;
use crate::retry::task_backoff;
use crate::store::{ClaimCandidate, KeySpace, Move, Store, StoreOp};
use crate::task::{
    EnqueueOptions, HandlerError, Priority, Task, TaskId, TaskResult, TaskStatus,
};
#[cfg(feature = "telemetry")]
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error message recorded when the reaper takes a claim back
pub const VISIBILITY_EXPIRED: &str = "visibility timeout expired";

/// Where a task currently is, as seen by [`TaskQueue::get_task_status`]
#[derive(Debug, Clone, PartialEq)]
pub enum TaskLookup {
    /// Terminal result recorded (success, or the final failure)
    Finished(TaskResult),
    /// Claimed by a worker until `deadline`
    Processing {
        task: Task,
        deadline: DateTime<Utc>,
    },
    /// Waiting in a pending tier
    Pending(Task),
    /// Waiting for `scheduled_at`
    Delayed {
        task: Task,
        scheduled_at: DateTime<Utc>,
    },
    /// Retries exhausted; parked until requeued or purged. The final
    /// error is the last entry of `failures`.
    DeadLettered(Task),
    Cancelled(Task),
    /// Record exists but the task is between two structures
    InTransit(Task),
    /// Unknown id, or its retention has elapsed
    NotFound,
}

impl TaskLookup {
    pub fn is_found(&self) -> bool {
        !matches!(self, TaskLookup::NotFound)
    }

    /// Status implied by the lookup
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskLookup::Finished(result) if result.is_success() => Some(TaskStatus::Completed),
            TaskLookup::Finished(_) => Some(TaskStatus::Failed),
            TaskLookup::Processing { .. } => Some(TaskStatus::Processing),
            TaskLookup::Pending(_) => Some(TaskStatus::Pending),
            TaskLookup::Delayed { .. } => Some(TaskStatus::Delayed),
            TaskLookup::DeadLettered(_) => Some(TaskStatus::DeadLettered),
            TaskLookup::Cancelled(_) => Some(TaskStatus::Cancelled),
            TaskLookup::InTransit(task) => Some(task.status),
            TaskLookup::NotFound => None,
        }
    }
}

/// Result of [`TaskQueue::fail`]
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Re-delayed; becomes visible again at `retry_at`
    Retrying {
        retry_at: DateTime<Utc>,
        attempt: u32,
    },
    /// Retries exhausted, moved to the dead-letter set
    DeadLettered,
    /// Retries exhausted on a queue without dead-lettering
    Failed,
    /// The claim was already lost; nothing changed
    Stale,
}

/// Result of [`TaskQueue::complete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The claim was still held
    OnTime,
    /// The claim had been reaped; the success was recorded anyway
    Late,
}

/// Number of tasks in each structure of one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueDepth {
    /// Pending count per tier, highest priority first
    pub pending: Vec<usize>,
    pub delayed: usize,
    pub processing: usize,
    pub dead_letter: usize,
}

impl QueueDepth {
    pub fn total_pending(&self) -> usize {
        self.pending.iter().sum()
    }
}

/// Metric observations, recorded to [`QueueMetrics`] and the OpenTelemetry
/// recorder when those features are enabled
#[derive(Debug, Clone, Copy)]
pub(crate) enum Tally {
    Enqueued,
    Dequeued { wait_ms: f64, dequeue_ms: f64 },
    Completed { latency_ms: f64 },
    Failed,
    Retried,
    DeadLettered,
    Reaped,
    Promoted(usize),
    Released,
    Cancelled,
}

fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.contains(':') || queue.chars().any(char::is_whitespace) {
        return Err(TaskQueueError::InvalidQueue(queue.to_string()));
    }
    Ok(())
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64
}

/// Task queue engine over a shared store
pub struct TaskQueue {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) config: QueueConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventEmitter,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<QueueMetrics>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            events: EventEmitter::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Use a custom time source (builder pattern)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish to a shared emitter (builder pattern)
    pub fn with_event_emitter(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Record queue metrics (builder pattern)
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&QueueMetrics> {
        self.metrics.as_ref()
    }

    fn keys(&self) -> &KeySpace {
        self.store.keys()
    }

    /// Pending tier of a task, clamped to the configured tiers
    fn tier_of(&self, task: &Task) -> Priority {
        task.priority.min(self.config.priority_tiers.saturating_sub(1))
    }

    #[allow(unused_variables)]
    pub(crate) async fn tally(&self, queue: &str, tally: Tally) {
        #[cfg(feature = "telemetry")]
        telemetry::record_tally(queue, tally);
        #[cfg(feature = "metrics")]
        self.record_metrics(queue, tally).await;
    }

    #[cfg(feature = "metrics")]
    async fn record_metrics(&self, queue: &str, tally: Tally) {
        let Some(m) = &self.metrics else {
            return;
        };
        match tally {
            Tally::Enqueued => m.record_enqueue(queue).await,
            Tally::Dequeued {
                wait_ms,
                dequeue_ms,
            } => m.record_dequeue(queue, wait_ms, dequeue_ms).await,
            Tally::Completed { latency_ms } => m.record_complete(queue, latency_ms).await,
            Tally::Failed => m.record_failure(queue).await,
            Tally::Retried => m.record_retry(queue).await,
            Tally::DeadLettered => m.record_dead_letter(queue).await,
            Tally::Reaped => m.record_reap(queue).await,
            Tally::Promoted(n) => m.record_promote(queue, n).await,
            Tally::Released => m.record_release(queue).await,
            Tally::Cancelled => m.record_cancel(queue).await,
        }
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Add a task to `queue` and return its id.
    ///
    /// Without a delay the task lands in the pending tier for its priority;
    /// with one it waits in the delayed set until the scheduler promotes it.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<TaskId> {
        validate_queue_name(queue)?;
        let priority = options.priority.unwrap_or(self.config.default_priority);
        if priority >= self.config.priority_tiers {
            return Err(TaskQueueError::InvalidPriority {
                priority,
                tiers: self.config.priority_tiers,
            });
        }
        let policy = self.config.policy_for(queue);
        let max_attempts = options.max_attempts.unwrap_or(policy.max_attempts);
        if max_attempts == 0 {
            return Err(TaskQueueError::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let scheduled_at = options
            .delay
            .filter(|delay| !delay.is_zero())
            .map(|delay| offset(now, delay));

        let task = Task {
            id: TaskId::new(),
            queue: queue.to_string(),
            kind: options.kind,
            payload,
            priority,
            status: if scheduled_at.is_some() {
                TaskStatus::Delayed
            } else {
                TaskStatus::Pending
            },
            created_at: now,
            scheduled_at,
            visible_after: None,
            attempt: 0,
            max_attempts,
            backoff_base: options.backoff_base.unwrap_or(policy.backoff_base),
            failures: Vec::new(),
        };

        let placement = match scheduled_at {
            Some(at) => StoreOp::Add {
                key: self.keys().delayed(queue),
                id: task.id,
                score: score_of(at),
            },
            None => StoreOp::Add {
                key: self.keys().pending(queue, priority),
                id: task.id,
                score: score_of(now),
            },
        };

        self.store
            .write_multi(vec![
                StoreOp::PutTask {
                    task: task.clone(),
                    ttl: None,
                },
                placement,
                StoreOp::TrackQueue(queue.to_string()),
            ])
            .await?;

        tracing::debug!(
            task_id = %task.id,
            queue = %queue,
            priority,
            delayed = scheduled_at.is_some(),
            "taskq.enqueue: task accepted"
        );
        self.events.emit(QueueEvent::for_task(
            events::TASK_ENQUEUED,
            &task,
            [(
                "scheduled_at",
                serde_json::json!(scheduled_at.map(|t| t.to_rfc3339())),
            )],
        ));
        self.tally(queue, Tally::Enqueued).await;

        Ok(task.id)
    }

    // ========================================================================
    // Dequeue
    // ========================================================================

    fn claim_candidates<S: AsRef<str>>(&self, queues: &[S], now: DateTime<Utc>) -> Vec<ClaimCandidate> {
        let keys = self.keys();
        let mut candidates =
            Vec::with_capacity(queues.len() * usize::from(self.config.priority_tiers));
        for queue in queues {
            let queue = queue.as_ref();
            let deadline = offset(now, self.config.policy_for(queue).visibility_timeout);
            let processing = keys.processing(queue);
            for tier in 0..self.config.priority_tiers {
                candidates.push(ClaimCandidate {
                    pending: keys.pending(queue, tier),
                    processing: processing.clone(),
                    visible_after: deadline,
                });
            }
        }
        candidates
    }

    async fn claim<S>(&self, queues: &[S], started: Instant) -> Result<Option<Task>>
    where
        S: AsRef<str> + Sync,
    {
        let now = self.clock.now();
        let candidates = self.claim_candidates(queues, now);
        let Some(task) = self.store.pop_highest_priority(&candidates).await? else {
            return Ok(None);
        };

        let visible_since = task.scheduled_at.unwrap_or(task.created_at);
        tracing::debug!(
            task_id = %task.id,
            queue = %task.queue,
            attempt = task.attempt,
            "taskq.dequeue: task claimed"
        );
        self.events.emit(QueueEvent::for_task(
            events::TASK_DEQUEUED,
            &task,
            [(
                "deadline",
                serde_json::json!(task.visible_after.map(|t| t.to_rfc3339())),
            )],
        ));
        self.tally(
            &task.queue,
            Tally::Dequeued {
                wait_ms: millis_between(visible_since, now),
                dequeue_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
        )
        .await;
        Ok(Some(task))
    }

    /// Claim one task without waiting.
    ///
    /// Keys are tried queue by queue in caller order, tiers highest first
    /// within each queue.
    pub async fn try_dequeue<S>(&self, queues: &[S]) -> Result<Option<Task>>
    where
        S: AsRef<str> + Sync,
    {
        self.claim(queues, Instant::now()).await
    }

    /// Claim one task, polling every `poll_interval` for up to `wait`
    pub async fn dequeue<S>(&self, queues: &[S], wait: Duration) -> Result<Option<Task>>
    where
        S: AsRef<str> + Sync,
    {
        self.dequeue_until(queues, wait, &CancellationToken::new())
            .await
    }

    /// [`dequeue`](Self::dequeue) that gives up early when `cancel` fires
    pub async fn dequeue_until<S>(
        &self,
        queues: &[S],
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Task>>
    where
        S: AsRef<str> + Sync,
    {
        let started = Instant::now();
        let deadline = started + wait;
        loop {
            if let Some(task) = self.claim(queues, started).await? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    /// Record a successful run of a claimed task.
    ///
    /// Normally one fenced move out of the processing set. When the claim
    /// was already reaped, the task is pulled out of every structure and the
    /// success is written anyway.
    pub async fn complete(&self, claimed: &Task, output: serde_json::Value) -> Result<Completion> {
        let now = self.clock.now();
        let keys = self.keys();
        let queue = claimed.queue.as_str();
        let ttl = self.config.result_ttl;

        let mut done = claimed.clone();
        done.status = TaskStatus::Completed;
        done.visible_after = None;
        let result = TaskResult::success(&done, output, now);

        let mut mv = Move::new(claimed.id, keys.processing(queue))
            .put_task(done.clone(), Some(ttl))
            .put_result(result.clone(), ttl);
        if let Some(deadline) = claimed.visible_after {
            mv = mv.expect(score_of(deadline));
        }

        let completion = if self.store.atomic_move(mv).await? {
            Completion::OnTime
        } else {
            let mut ops: Vec<StoreOp> = (0..self.config.priority_tiers)
                .map(|tier| StoreOp::Remove {
                    key: keys.pending(queue, tier),
                    id: claimed.id,
                })
                .collect();
            for key in [keys.delayed(queue), keys.processing(queue), keys.dead(queue)] {
                ops.push(StoreOp::Remove {
                    key,
                    id: claimed.id,
                });
            }
            ops.push(StoreOp::PutTask {
                task: done.clone(),
                ttl: Some(ttl),
            });
            ops.push(StoreOp::PutResult { result, ttl });
            self.store.write_multi(ops).await?;

            tracing::warn!(
                task_id = %claimed.id,
                queue = %queue,
                attempt = claimed.attempt,
                "taskq.complete: claim was reaped, recording late completion"
            );
            Completion::Late
        };

        let visibility = self.config.policy_for(queue).visibility_timeout;
        let latency_ms = claimed
            .visible_after
            .map(|deadline| {
                millis_between(rewind(deadline, visibility), now)
            })
            .unwrap_or(0.0);
        tracing::debug!(task_id = %claimed.id, queue = %queue, "taskq.complete: task completed");
        self.events.emit(QueueEvent::for_task(
            events::TASK_COMPLETED,
            &done,
            [("late", serde_json::json!(completion == Completion::Late))],
        ));
        self.tally(queue, Tally::Completed { latency_ms }).await;

        Ok(completion)
    }

    /// Record a failed run of a claimed task.
    ///
    /// Re-delays with exponential backoff while attempts remain, otherwise
    /// dead-letters (or marks failed when the queue disables dead-lettering).
    pub async fn fail(&self, claimed: &Task, failure: HandlerError) -> Result<FailOutcome> {
        self.fail_with(claimed, failure, claimed.visible_after.map(score_of))
            .await
    }

    async fn fail_with(
        &self,
        claimed: &Task,
        failure: HandlerError,
        expect_score: Option<i64>,
    ) -> Result<FailOutcome> {
        let now = self.clock.now();
        let keys = self.keys();
        let queue = claimed.queue.as_str();
        let policy = self.config.policy_for(queue);
        let ttl = self.config.result_ttl;

        let error = failure.into_error(claimed.attempt, now);
        let mut next = claimed.clone();
        next.failures.push(error.clone());
        next.visible_after = None;

        let from = keys.processing(queue);
        let (mv, outcome) = if claimed.has_attempts_left() {
            let delay = task_backoff(claimed.backoff_base, claimed.attempt, policy.max_backoff);
            let retry_at = offset(now, delay);
            next.status = TaskStatus::Delayed;
            next.scheduled_at = Some(retry_at);
            (
                Move::new(claimed.id, from)
                    .to(keys.delayed(queue), score_of(retry_at))
                    .put_task(next.clone(), None),
                FailOutcome::Retrying {
                    retry_at,
                    attempt: claimed.attempt,
                },
            )
        } else if policy.dead_letter {
            next.status = TaskStatus::DeadLettered;
            let result = TaskResult::failure(&next, error.clone(), now);
            (
                Move::new(claimed.id, from)
                    .to(keys.dead(queue), score_of(now))
                    .put_task(next.clone(), None)
                    .put_result(result, ttl),
                FailOutcome::DeadLettered,
            )
        } else {
            next.status = TaskStatus::Failed;
            let result = TaskResult::failure(&next, error.clone(), now);
            (
                Move::new(claimed.id, from)
                    .put_task(next.clone(), Some(ttl))
                    .put_result(result, ttl),
                FailOutcome::Failed,
            )
        };
        let mv = match expect_score {
            Some(score) => mv.expect(score),
            None => mv,
        };

        if !self.store.atomic_move(mv).await? {
            tracing::debug!(
                task_id = %claimed.id,
                queue = %queue,
                "taskq.fail: claim already lost, ignoring failure"
            );
            return Ok(FailOutcome::Stale);
        }

        self.events.emit(QueueEvent::for_task(
            events::TASK_FAILED,
            &next,
            [
                ("error", serde_json::json!(error.message)),
                (
                    "will_retry",
                    serde_json::json!(matches!(outcome, FailOutcome::Retrying { .. })),
                ),
            ],
        ));
        self.tally(queue, Tally::Failed).await;

        match &outcome {
            FailOutcome::Retrying { retry_at, attempt } => {
                tracing::info!(
                    task_id = %claimed.id,
                    queue = %queue,
                    attempt,
                    max_attempts = claimed.max_attempts,
                    retry_at = %retry_at,
                    error = %error.message,
                    "taskq.retry: retry scheduled"
                );
                self.events.emit(QueueEvent::for_task(
                    events::TASK_RETRY_SCHEDULED,
                    &next,
                    [("retry_at", serde_json::json!(retry_at.to_rfc3339()))],
                ));
                self.tally(queue, Tally::Retried).await;
            }
            FailOutcome::DeadLettered => {
                tracing::warn!(
                    task_id = %claimed.id,
                    queue = %queue,
                    attempts = claimed.attempt,
                    error = %error.message,
                    "taskq.dead_letter: retries exhausted"
                );
                self.events.emit(QueueEvent::for_task(
                    events::TASK_DEAD_LETTERED,
                    &next,
                    [("error", serde_json::json!(error.message))],
                ));
                self.tally(queue, Tally::DeadLettered).await;
            }
            FailOutcome::Failed => {
                tracing::warn!(
                    task_id = %claimed.id,
                    queue = %queue,
                    attempts = claimed.attempt,
                    error = %error.message,
                    "taskq.fail: retries exhausted, task failed"
                );
            }
            FailOutcome::Stale => {}
        }

        Ok(outcome)
    }

    /// Hand a claimed task back without counting the attempt as a failure.
    ///
    /// The task waits `delay` in the delayed set. The claim's attempt stays
    /// counted, so `max_attempts` is raised by one to keep the budget intact.
    /// Returns `false` when the claim was already lost.
    pub async fn release(&self, claimed: &Task, delay: Duration) -> Result<bool> {
        let now = self.clock.now();
        let keys = self.keys();
        let queue = claimed.queue.as_str();
        let retry_at = offset(now, delay);

        let mut next = claimed.clone();
        next.status = TaskStatus::Delayed;
        next.scheduled_at = Some(retry_at);
        next.visible_after = None;
        next.max_attempts = next.max_attempts.saturating_add(1);

        let mut mv = Move::new(claimed.id, keys.processing(queue))
            .to(keys.delayed(queue), score_of(retry_at))
            .put_task(next.clone(), None);
        if let Some(deadline) = claimed.visible_after {
            mv = mv.expect(score_of(deadline));
        }
        if !self.store.atomic_move(mv).await? {
            return Ok(false);
        }

        tracing::debug!(
            task_id = %claimed.id,
            queue = %queue,
            retry_at = %retry_at,
            "taskq.release: task handed back"
        );
        self.events.emit(QueueEvent::for_task(
            events::TASK_RELEASED,
            &next,
            [("retry_at", serde_json::json!(retry_at.to_rfc3339()))],
        ));
        self.tally(queue, Tally::Released).await;
        Ok(true)
    }

    /// Remove a pending or delayed task.
    ///
    /// Returns `false` when the task is unknown, claimed, or already finished.
    /// A claimed task can only be stopped through its `TaskContext` token.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool> {
        let Some(task) = self.store.get_task(id).await? else {
            return Ok(false);
        };
        let keys = self.keys();
        let queue = task.queue.as_str();

        let mut cancelled = task.clone();
        cancelled.status = TaskStatus::Cancelled;
        cancelled.visible_after = None;

        for from in [keys.pending(queue, self.tier_of(&task)), keys.delayed(queue)] {
            let mv = Move::new(*id, from).put_task(cancelled.clone(), Some(self.config.result_ttl));
            if self.store.atomic_move(mv).await? {
                tracing::info!(task_id = %id, queue = %queue, "taskq.cancel: task cancelled");
                self.events
                    .emit(QueueEvent::for_task(events::TASK_CANCELLED, &cancelled, []));
                self.tally(queue, Tally::Cancelled).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Locate a task.
    ///
    /// Checks the result first, then the processing set, the pending tier,
    /// the delayed set and the dead-letter set of the task's queue. A
    /// finished record whose result has expired reads as `NotFound`.
    pub async fn get_task_status(&self, id: &TaskId) -> Result<TaskLookup> {
        let result = self.store.get_result(id).await?;
        if let Some(result) = result.as_ref().filter(|r| r.is_success()) {
            return Ok(TaskLookup::Finished(result.clone()));
        }
        let Some(task) = self.store.get_task(id).await? else {
            return Ok(match result {
                Some(result) => TaskLookup::Finished(result),
                None => TaskLookup::NotFound,
            });
        };
        let keys = self.keys();
        let queue = task.queue.as_str();

        // a final failure is also recorded for dead letters
        if let Some(result) = result {
            if self.store.score(&keys.dead(queue), id).await?.is_some() {
                return Ok(TaskLookup::DeadLettered(task));
            }
            return Ok(TaskLookup::Finished(result));
        }

        if let Some(score) = self.store.score(&keys.processing(queue), id).await? {
            let deadline = task.visible_after.or_else(|| from_score(score));
            if let Some(deadline) = deadline {
                return Ok(TaskLookup::Processing { task, deadline });
            }
        }
        if self
            .store
            .score(&keys.pending(queue, self.tier_of(&task)), id)
            .await?
            .is_some()
        {
            return Ok(TaskLookup::Pending(task));
        }
        if let Some(score) = self.store.score(&keys.delayed(queue), id).await? {
            if let Some(scheduled_at) = from_score(score) {
                return Ok(TaskLookup::Delayed { task, scheduled_at });
            }
        }
        if self.store.score(&keys.dead(queue), id).await?.is_some() {
            return Ok(TaskLookup::DeadLettered(task));
        }

        Ok(match task.status {
            TaskStatus::Cancelled => TaskLookup::Cancelled(task),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLettered => {
                TaskLookup::NotFound
            }
            _ => TaskLookup::InTransit(task),
        })
    }

    /// Structure sizes of `queue`
    pub async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let keys = self.keys();
        let mut pending = Vec::with_capacity(usize::from(self.config.priority_tiers));
        for tier in 0..self.config.priority_tiers {
            pending.push(self.store.card(&keys.pending(queue, tier)).await?);
        }
        Ok(QueueDepth {
            pending,
            delayed: self.store.card(&keys.delayed(queue)).await?,
            processing: self.store.card(&keys.processing(queue)).await?,
            dead_letter: self.store.card(&keys.dead(queue)).await?,
        })
    }

    /// Every queue that has received a task
    pub async fn queues(&self) -> Result<Vec<String>> {
        self.store.queues().await
    }

    // ========================================================================
    // Scheduler steps
    // ========================================================================

    /// Move up to `limit` due delayed tasks of `queue` to their pending tier.
    ///
    /// Each move is fenced on the delayed score, so concurrent promoters
    /// never duplicate a task. Per-task errors are logged and skipped.
    pub async fn promote_due(&self, queue: &str, limit: usize) -> Result<usize> {
        let now = self.clock.now();
        let delayed = self.keys().delayed(queue);
        let due = self
            .store
            .read_range_by_score(&delayed, score_of(now), limit)
            .await?;

        let mut promoted = 0;
        for (id, score) in due {
            match self.promote_one(&delayed, id, score).await {
                Ok(true) => promoted += 1,
                Ok(false) => {
                    tracing::debug!(task_id = %id, queue = %queue, "taskq.promote: already moved")
                }
                Err(e) => {
                    tracing::warn!(task_id = %id, queue = %queue, error = %e, "taskq.promote: skipped")
                }
            }
        }
        self.tally(queue, Tally::Promoted(promoted)).await;
        Ok(promoted)
    }

    async fn promote_one(&self, delayed: &str, id: TaskId, score: i64) -> Result<bool> {
        let Some(task) = self.store.get_task(&id).await? else {
            // orphan entry; drop it
            self.store
                .atomic_move(Move::new(id, delayed).expect(score))
                .await?;
            return Ok(false);
        };
        let mut next = task.clone();
        next.status = TaskStatus::Pending;
        next.visible_after = None;

        let mv = Move::new(id, delayed)
            .expect(score)
            .to(self.keys().pending(&task.queue, self.tier_of(&task)), score)
            .put_task(next.clone(), None);
        if !self.store.atomic_move(mv).await? {
            return Ok(false);
        }
        self.events
            .emit(QueueEvent::for_task(events::TASK_PROMOTED, &next, []));
        Ok(true)
    }

    /// Take back up to `limit` claims of `queue` whose deadline has passed.
    ///
    /// Each one goes through the failure path with [`VISIBILITY_EXPIRED`],
    /// fenced on its deadline, so the retry budget still applies.
    pub async fn reap_expired(&self, queue: &str, limit: usize) -> Result<usize> {
        let now = self.clock.now();
        let processing = self.keys().processing(queue);
        let expired = self
            .store
            .read_range_by_score(&processing, score_of(now), limit)
            .await?;

        let mut reaped = 0;
        for (id, score) in expired {
            let task = match self.store.get_task(&id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    if let Err(e) = self
                        .store
                        .atomic_move(Move::new(id, processing.as_str()).expect(score))
                        .await
                    {
                        tracing::warn!(task_id = %id, error = %e, "taskq.reap: orphan not removed");
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(task_id = %id, queue = %queue, error = %e, "taskq.reap: skipped");
                    continue;
                }
            };

            match self
                .fail_with(&task, HandlerError::new(VISIBILITY_EXPIRED), Some(score))
                .await
            {
                Ok(FailOutcome::Stale) => {
                    tracing::debug!(task_id = %id, queue = %queue, "taskq.reap: already resolved")
                }
                Ok(outcome) => {
                    reaped += 1;
                    tracing::warn!(
                        task_id = %id,
                        queue = %queue,
                        attempt = task.attempt,
                        outcome = ?outcome,
                        "taskq.reap: visibility timeout expired"
                    );
                    self.events
                        .emit(QueueEvent::for_task(events::TASK_REAPED, &task, []));
                    self.tally(queue, Tally::Reaped).await;
                }
                Err(e) => {
                    tracing::warn!(task_id = %id, queue = %queue, error = %e, "taskq.reap: skipped")
                }
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::task::priorities;
    use std::collections::HashSet;

    fn setup(config: QueueConfig) -> (TaskQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = TaskQueue::new(store, config).with_clock(clock.clone());
        (queue, clock)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig::default()
            .with_visibility_timeout(Duration::from_secs(30))
            .with_backoff(Duration::from_secs(1), Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn enqueue(queue: &TaskQueue, name: &str, priority: Priority) -> TaskId {
        queue
            .enqueue(
                name,
                serde_json::json!({"n": priority}),
                EnqueueOptions::new().with_priority(priority),
            )
            .await
            .unwrap()
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    #[tokio::test]
    async fn test_enqueue_then_claim() {
        let (queue, clock) = setup(fast_config());
        let id = enqueue(&queue, "emails", priorities::NORMAL).await;

        let task = queue.try_dequeue(&["emails"]).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.attempt, 1);
        assert_eq!(
            task.visible_after,
            Some(offset(clock.now(), Duration::from_secs(30)))
        );
        assert!(queue.try_dequeue(&["emails"]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_input() {
        let (queue, _) = setup(fast_config());
        for name in ["", "a:b", "with space"] {
            assert!(matches!(
                queue.enqueue(name, serde_json::json!({}), EnqueueOptions::new()).await,
                Err(TaskQueueError::InvalidQueue(_))
            ));
        }
        assert!(matches!(
            queue
                .enqueue("q", serde_json::json!({}), EnqueueOptions::new().with_priority(3))
                .await,
            Err(TaskQueueError::InvalidPriority {
                priority: 3,
                tiers: 3
            })
        ));
        assert!(queue.queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_uses_queue_overrides() {
        let config = fast_config().with_overrides(
            "reports",
            crate::config::QueueOverrides {
                max_attempts: Some(9),
                backoff_base: Some(Duration::from_millis(250)),
                ..Default::default()
            },
        );
        let (queue, _) = setup(config);
        let id = queue
            .enqueue("reports", serde_json::json!({}), EnqueueOptions::new())
            .await
            .unwrap();

        let TaskLookup::Pending(task) = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected pending");
        };
        assert_eq!(task.max_attempts, 9);
        assert_eq!(task.backoff_base, Duration::from_millis(250));
        assert_eq!(task.priority, priorities::NORMAL);
    }

    #[tokio::test]
    async fn test_enqueue_emits_event() {
        let (queue, _) = setup(fast_config());
        let mut rx = queue.events().subscribe();
        let id = enqueue(&queue, "emails", priorities::HIGH).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::TASK_ENQUEUED);
        assert_eq!(event.field("task_id"), Some(&serde_json::json!(id.to_string())));
    }

    // ========================================================================
    // Priority ordering
    // ========================================================================

    #[tokio::test]
    async fn test_higher_tiers_dequeue_first() {
        let (queue, _) = setup(fast_config());
        let mut low = Vec::new();
        let mut high = Vec::new();
        for _ in 0..3 {
            low.push(enqueue(&queue, "q", priorities::LOW).await);
            high.push(enqueue(&queue, "q", priorities::HIGH).await);
        }

        let mut order = Vec::new();
        while let Some(task) = queue.try_dequeue(&["q"]).await.unwrap() {
            order.push(task.id);
        }
        assert_eq!(order.len(), 6);
        assert_eq!(&order[..3], high.as_slice());
        assert_eq!(&order[3..], low.as_slice());
    }

    #[tokio::test]
    async fn test_queue_order_is_caller_order() {
        let (queue, _) = setup(fast_config());
        let b_high = enqueue(&queue, "b", priorities::HIGH).await;
        let a_low = enqueue(&queue, "a", priorities::LOW).await;

        let first = queue.try_dequeue(&["a", "b"]).await.unwrap().unwrap();
        assert_eq!(first.id, a_low);
        let second = queue.try_dequeue(&["a", "b"]).await.unwrap().unwrap();
        assert_eq!(second.id, b_high);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_double_claim_under_concurrency() {
        let (queue, _) = setup(fast_config());
        let queue = Arc::new(queue);
        let mut ids = HashSet::new();
        for i in 0..60 {
            ids.insert(enqueue(&queue, "q", (i % 3) as Priority).await);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = queue.try_dequeue(&["q"]).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "task {} claimed twice", id);
            }
        }
        assert_eq!(seen, ids);
    }

    // ========================================================================
    // Delay and promotion
    // ========================================================================

    #[tokio::test]
    async fn test_delay_is_honored() {
        let (queue, clock) = setup(fast_config());
        let id = queue
            .enqueue(
                "q",
                serde_json::json!({}),
                EnqueueOptions::new().with_delay(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        assert!(matches!(
            queue.get_task_status(&id).await.unwrap(),
            TaskLookup::Delayed { .. }
        ));
        assert_eq!(queue.promote_due("q", 100).await.unwrap(), 0);
        assert!(queue.try_dequeue(&["q"]).await.unwrap().is_none());

        clock.advance(Duration::from_secs(9));
        assert_eq!(queue.promote_due("q", 100).await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(queue.promote_due("q", 100).await.unwrap(), 1);
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn test_promotion_is_idempotent() {
        let (queue, clock) = setup(fast_config());
        for _ in 0..3 {
            queue
                .enqueue(
                    "q",
                    serde_json::json!({}),
                    EnqueueOptions::new().with_delay(Duration::from_secs(1)),
                )
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(1));

        assert_eq!(queue.promote_due("q", 2).await.unwrap(), 2);
        assert_eq!(queue.promote_due("q", 10).await.unwrap(), 1);
        assert_eq!(queue.promote_due("q", 10).await.unwrap(), 0);
        assert_eq!(queue.depth("q").await.unwrap().total_pending(), 3);
    }

    #[tokio::test]
    async fn test_promoted_task_reads_as_pending() {
        let (queue, clock) = setup(fast_config());
        let id = queue
            .enqueue(
                "q",
                serde_json::json!({}),
                EnqueueOptions::new()
                    .with_delay(Duration::from_secs(1))
                    .with_priority(priorities::HIGH),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));
        queue.promote_due("q", 10).await.unwrap();

        let TaskLookup::Pending(task) = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected pending");
        };
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(queue.depth("q").await.unwrap().pending, vec![1, 0, 0]);
    }

    // ========================================================================
    // Completion
    // ========================================================================

    #[tokio::test]
    async fn test_complete_writes_result() {
        let (queue, _) = setup(fast_config());
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        let completion = queue
            .complete(&task, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(completion, Completion::OnTime);

        let TaskLookup::Finished(result) = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected finished");
        };
        assert!(result.is_success());
        assert_eq!(result.output, Some(serde_json::json!({"ok": true})));
        assert_eq!(result.attempt_at_completion, 1);
        assert_eq!(queue.depth("q").await.unwrap(), QueueDepth {
            pending: vec![0, 0, 0],
            ..Default::default()
        });
    }

    #[tokio::test]
    async fn test_result_expires_after_ttl() {
        let (queue, clock) = setup(fast_config().with_result_ttl(Duration::from_secs(60)));
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        queue.complete(&task, serde_json::json!(null)).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(queue.get_task_status(&id).await.unwrap(), TaskLookup::NotFound);
    }

    // ========================================================================
    // Retry and dead-letter
    // ========================================================================

    #[tokio::test]
    async fn test_retries_then_dead_letters() {
        let (queue, clock) = setup(fast_config().with_max_attempts(3));
        let id = enqueue(&queue, "q", priorities::NORMAL).await;

        let mut delays = Vec::new();
        for attempt in 1..=3u32 {
            let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
            assert_eq!(task.attempt, attempt);

            let outcome = queue
                .fail(&task, HandlerError::new(format!("boom {}", attempt)))
                .await
                .unwrap();
            match outcome {
                FailOutcome::Retrying { retry_at, attempt: a } => {
                    assert_eq!(a, attempt);
                    let delay = (retry_at - clock.now()).to_std().unwrap();
                    assert_eq!(delay, Duration::from_secs(1) * 2u32.pow(attempt));
                    delays.push(delay);
                    assert!(queue.try_dequeue(&["q"]).await.unwrap().is_none());
                    clock.advance(delay);
                    assert_eq!(queue.promote_due("q", 10).await.unwrap(), 1);
                }
                FailOutcome::DeadLettered => assert_eq!(attempt, 3),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        let TaskLookup::DeadLettered(task) = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected dead-lettered");
        };
        assert_eq!(task.status, TaskStatus::DeadLettered);
        assert_eq!(task.attempt, 3);
        assert_eq!(task.failures.last().unwrap().message, "boom 3");

        let depth = queue.depth("q").await.unwrap();
        assert_eq!(depth.dead_letter, 1);
        assert_eq!(depth.total_pending() + depth.delayed + depth.processing, 0);

        let letters = queue.dead_letters("q", 0, 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task_id, id);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].failures.len(), 3);
        let messages: Vec<_> = letters[0].failures.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, vec!["boom 1", "boom 2", "boom 3"]);
    }

    #[tokio::test]
    async fn test_exhausted_without_dead_letter_is_failed() {
        let (queue, _) = setup(fast_config().with_max_attempts(1).with_dead_letter(false));
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        let outcome = queue.fail(&task, "nope".into()).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        assert_eq!(queue.depth("q").await.unwrap().dead_letter, 0);
        assert_eq!(
            queue.get_task_status(&id).await.unwrap().status(),
            Some(TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_fail_records_history_and_detail() {
        let (queue, clock) = setup(fast_config());
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        queue
            .fail(
                &task,
                HandlerError::new("bad").with_detail(serde_json::json!({"code": 4})),
            )
            .await
            .unwrap();

        let TaskLookup::Delayed { task, scheduled_at } =
            queue.get_task_status(&id).await.unwrap()
        else {
            panic!("expected delayed");
        };
        assert_eq!(scheduled_at, offset(clock.now(), Duration::from_secs(2)));
        assert_eq!(task.failures.len(), 1);
        assert_eq!(task.failures[0].attempt, 1);
        assert_eq!(task.failures[0].detail, Some(serde_json::json!({"code": 4})));
    }

    // ========================================================================
    // Reaper and fencing
    // ========================================================================

    #[tokio::test]
    async fn test_reaped_task_is_redelivered() {
        let (queue, clock) = setup(fast_config());
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let first = queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(29));
        assert_eq!(queue.reap_expired("q", 10).await.unwrap(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(queue.reap_expired("q", 10).await.unwrap(), 1);
        assert_eq!(queue.reap_expired("q", 10).await.unwrap(), 0);

        // first worker's failure arrives after the reap
        assert_eq!(
            queue.fail(&first, "late failure".into()).await.unwrap(),
            FailOutcome::Stale
        );

        clock.advance(Duration::from_secs(2));
        queue.promote_due("q", 10).await.unwrap();
        let second = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.failures[0].message, VISIBILITY_EXPIRED);

        assert_eq!(
            queue.complete(&second, serde_json::json!(2)).await.unwrap(),
            Completion::OnTime
        );
        let TaskLookup::Finished(result) = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected finished");
        };
        assert_eq!(result.output, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_late_completion_wins() {
        let (queue, clock) = setup(fast_config());
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let first = queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(31));
        queue.reap_expired("q", 10).await.unwrap();

        assert_eq!(
            queue.complete(&first, serde_json::json!("slow")).await.unwrap(),
            Completion::Late
        );
        let depth = queue.depth("q").await.unwrap();
        assert_eq!(depth.delayed, 0);
        assert_eq!(depth.processing, 0);

        clock.advance(Duration::from_secs(10));
        assert_eq!(queue.promote_due("q", 10).await.unwrap(), 0);
        assert!(queue.try_dequeue(&["q"]).await.unwrap().is_none());
        assert!(matches!(
            queue.get_task_status(&id).await.unwrap(),
            TaskLookup::Finished(r) if r.is_success()
        ));
    }

    #[tokio::test]
    async fn test_reap_exhausted_task_dead_letters() {
        let (queue, clock) = setup(fast_config().with_max_attempts(1));
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(queue.reap_expired("q", 10).await.unwrap(), 1);
        assert_eq!(queue.depth("q").await.unwrap().dead_letter, 1);
        assert_eq!(
            queue.get_task_status(&id).await.unwrap().status(),
            Some(TaskStatus::DeadLettered)
        );
    }

    #[tokio::test]
    async fn test_dead_lettered_status_differs_from_failed() {
        let (queue, _) = setup(fast_config().with_max_attempts(1));
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        assert_eq!(
            queue.fail(&task, "exhausted".into()).await.unwrap(),
            FailOutcome::DeadLettered
        );
        assert_eq!(
            queue.get_task_status(&id).await.unwrap().status(),
            Some(TaskStatus::DeadLettered)
        );

        assert!(queue.purge_dead_letter(&id).await.unwrap());
        assert_eq!(queue.get_task_status(&id).await.unwrap(), TaskLookup::NotFound);
    }

    // ========================================================================
    // Release, cancel and lookup
    // ========================================================================

    #[tokio::test]
    async fn test_release_keeps_attempt_budget() {
        let (queue, clock) = setup(fast_config().with_max_attempts(2));
        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();

        assert!(queue.release(&task, Duration::from_secs(5)).await.unwrap());
        assert!(!queue.release(&task, Duration::from_secs(5)).await.unwrap());

        let TaskLookup::Delayed { task, .. } = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected delayed");
        };
        assert_eq!(task.attempt, 1);
        assert_eq!(task.max_attempts, 3);
        assert!(task.failures.is_empty());

        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.promote_due("q", 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_delayed_only() {
        let (queue, _) = setup(fast_config());
        let pending = enqueue(&queue, "q", priorities::LOW).await;
        let delayed = queue
            .enqueue(
                "q",
                serde_json::json!({}),
                EnqueueOptions::new().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        let claimed = enqueue(&queue, "q", priorities::HIGH).await;
        assert_eq!(queue.try_dequeue(&["q"]).await.unwrap().unwrap().id, claimed);

        assert!(queue.cancel(&pending).await.unwrap());
        assert!(queue.cancel(&delayed).await.unwrap());
        assert!(!queue.cancel(&claimed).await.unwrap());
        assert!(!queue.cancel(&pending).await.unwrap());
        assert!(!queue.cancel(&TaskId::new()).await.unwrap());

        assert!(matches!(
            queue.get_task_status(&pending).await.unwrap(),
            TaskLookup::Cancelled(_)
        ));
        assert!(matches!(
            queue.get_task_status(&claimed).await.unwrap(),
            TaskLookup::Processing { .. }
        ));
    }

    #[tokio::test]
    async fn test_status_lookup_through_lifecycle() {
        let (queue, clock) = setup(fast_config());
        assert_eq!(
            queue.get_task_status(&TaskId::new()).await.unwrap(),
            TaskLookup::NotFound
        );

        let id = enqueue(&queue, "q", priorities::NORMAL).await;
        assert_eq!(
            queue.get_task_status(&id).await.unwrap().status(),
            Some(TaskStatus::Pending)
        );

        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        match queue.get_task_status(&id).await.unwrap() {
            TaskLookup::Processing { deadline, .. } => {
                assert_eq!(deadline, offset(clock.now(), Duration::from_secs(30)))
            }
            other => panic!("expected processing, got {:?}", other),
        }

        queue.complete(&task, serde_json::json!(1)).await.unwrap();
        assert_eq!(
            queue.get_task_status(&id).await.unwrap().status(),
            Some(TaskStatus::Completed)
        );
    }

    // ========================================================================
    // Blocking dequeue
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_when_empty() {
        let (queue, _) = setup(fast_config());
        let started = Instant::now();
        let task = queue.dequeue(&["q"], Duration::from_millis(500)).await.unwrap();
        assert!(task.is_none());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_waits_for_work() {
        let (queue, _) = setup(fast_config());
        let queue = Arc::new(queue);

        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            enqueue(&producer, "q", priorities::NORMAL).await
        });

        let task = queue.dequeue(&["q"], Duration::from_secs(5)).await.unwrap();
        assert!(task.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_until_stops_on_cancel() {
        let (queue, _) = setup(fast_config());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let task = queue
            .dequeue_until(&["q"], Duration::from_secs(60), &token)
            .await
            .unwrap();
        assert!(task.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_follow_transitions() {
        use crate::metrics::metric_names;

        let (queue, _) = setup(fast_config());
        let metrics = QueueMetrics::local();
        let queue = queue.with_metrics(metrics.clone());

        enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        queue.fail(&task, "x".into()).await.unwrap();

        let backend = metrics.backend();
        assert_eq!(backend.get_counter(metric_names::TASKS_ENQUEUED).await, Some(1));
        assert_eq!(backend.get_counter(metric_names::TASKS_DEQUEUED).await, Some(1));
        assert_eq!(backend.get_counter(metric_names::TASKS_FAILED).await, Some(1));
        assert_eq!(backend.get_counter("taskq.tasks.retried.q").await, Some(1));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_latency_with_oversized_visibility_timeout() {
        use crate::metrics::metric_names;

        let (queue, clock) = setup(fast_config().with_visibility_timeout(Duration::MAX));
        let metrics = QueueMetrics::local();
        let queue = queue.with_metrics(metrics.clone());

        enqueue(&queue, "q", priorities::NORMAL).await;
        let task = queue.try_dequeue(&["q"]).await.unwrap().unwrap();
        clock.advance(Duration::from_millis(250));
        assert_eq!(
            queue.complete(&task, serde_json::json!(null)).await.unwrap(),
            Completion::OnTime
        );

        let stats = metrics
            .backend()
            .get_histogram_stats(metric_names::TASK_LATENCY)
            .await
            .unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max, 250.0);
    }
}
