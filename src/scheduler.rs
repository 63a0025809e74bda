//! Promoter and reaper
//!
//! One loop per process, ticking on a fixed interval. Each tick promotes due
//! delayed tasks and takes back expired claims for every known queue. Every
//! move is fenced on its score, so running several schedulers against one
//! store is safe; leader election only saves the duplicate work.

use crate::clock::{from_score, score_of};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::queue::TaskQueue;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Lease name used for leader election
pub const LEADER_LEASE: &str = "scheduler";

const NEVER: i64 = i64::MIN;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    pub promoted: usize,
    pub reaped: usize,
    /// Another instance held the leader lease
    pub skipped: bool,
}

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    config: SchedulerConfig,
    holder: String,
    alive: AtomicBool,
    last_tick: AtomicI64,
}

impl Scheduler {
    pub fn new(queue: Arc<TaskQueue>, config: SchedulerConfig) -> Self {
        Self {
            queue,
            config,
            holder: format!("scheduler-{}", uuid::Uuid::new_v4()),
            alive: AtomicBool::new(false),
            last_tick: AtomicI64::new(NEVER),
        }
    }

    /// Identity used when competing for the leader lease
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one promotion and reaping pass over every known queue.
    ///
    /// Per-queue errors are logged and the queue is retried next tick.
    /// Only listing the queues or acquiring the lease can fail the tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        if self.config.leader_election {
            let leader = self
                .queue
                .store()
                .try_acquire_lease(LEADER_LEASE, &self.holder, self.config.lease_ttl)
                .await?;
            if !leader {
                tracing::debug!(holder = %self.holder, "taskq.tick: not leader, skipping");
                report.skipped = true;
                return Ok(report);
            }
        }

        let batch = self.config.batch_size;
        for queue in self.queue.queues().await? {
            match self.queue.promote_due(&queue, batch).await {
                Ok(n) => report.promoted += n,
                Err(e) => tracing::warn!(queue = %queue, error = %e, "taskq.tick: promotion failed"),
            }
            match self.queue.reap_expired(&queue, batch).await {
                Ok(n) => report.reaped += n,
                Err(e) => tracing::warn!(queue = %queue, error = %e, "taskq.tick: reaping failed"),
            }
            self.refresh_depth(&queue).await;
        }

        self.last_tick
            .store(score_of(self.queue.clock().now()), Ordering::Relaxed);
        if report.promoted > 0 || report.reaped > 0 {
            tracing::debug!(
                promoted = report.promoted,
                reaped = report.reaped,
                "taskq.tick: done"
            );
        }
        Ok(report)
    }

    #[cfg(feature = "metrics")]
    async fn refresh_depth(&self, queue: &str) {
        let Some(metrics) = self.queue.metrics() else {
            return;
        };
        match self.queue.depth(queue).await {
            Ok(depth) => {
                metrics
                    .set_queue_depth(
                        queue,
                        depth.total_pending(),
                        depth.delayed,
                        depth.processing,
                        depth.dead_letter,
                    )
                    .await
            }
            Err(e) => tracing::debug!(queue = %queue, error = %e, "taskq.tick: depth unavailable"),
        }
    }

    #[cfg(not(feature = "metrics"))]
    async fn refresh_depth(&self, _queue: &str) {}

    /// Tick every `tick_interval` until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.alive.store(true, Ordering::Relaxed);
            tracing::info!(
                tick_ms = self.config.tick_interval.as_millis() as u64,
                leader_election = self.config.leader_election,
                "taskq.scheduler: started"
            );

            let mut ticker = interval(self.config.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let span = tracing::debug_span!("taskq.tick", holder = %self.holder);
                        if let Err(e) = self.tick().instrument(span).await {
                            tracing::warn!(error = %e, "taskq.tick: failed");
                        }
                    }
                }
            }

            self.alive.store(false, Ordering::Relaxed);
            tracing::info!("taskq.scheduler: stopped");
        })
    }

    /// Whether the spawned loop is running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Queue-clock time of the last completed tick
    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        match self.last_tick.load(Ordering::Relaxed) {
            NEVER => None,
            score => from_score(score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::QueueConfig;
    use crate::queue::TaskLookup;
    use crate::store::{MemoryStore, Store};
    use crate::task::EnqueueOptions;
    use std::time::Duration;

    fn setup(config: QueueConfig) -> (Arc<TaskQueue>, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = TaskQueue::new(store.clone(), config).with_clock(clock.clone());
        (Arc::new(queue), clock, store)
    }

    #[tokio::test]
    async fn test_tick_promotes_due_tasks() {
        let (queue, clock, _) = setup(QueueConfig::default());
        let id = queue
            .enqueue(
                "emails",
                serde_json::json!({}),
                EnqueueOptions::new().with_delay(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        let scheduler = Scheduler::new(queue.clone(), SchedulerConfig::default());
        assert!(scheduler.last_tick().is_none());

        assert_eq!(scheduler.tick().await.unwrap().promoted, 0);
        clock.advance(Duration::from_secs(10));
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.promoted, 1);
        assert!(!report.skipped);
        assert!(matches!(
            queue.get_task_status(&id).await.unwrap(),
            TaskLookup::Pending(_)
        ));
        assert_eq!(
            scheduler.last_tick().unwrap().timestamp_millis(),
            clock.now().timestamp_millis()
        );

        assert_eq!(scheduler.tick().await.unwrap().promoted, 0);
    }

    #[tokio::test]
    async fn test_tick_reaps_expired_claims() {
        let (queue, clock, _) =
            setup(QueueConfig::default().with_visibility_timeout(Duration::from_secs(5)));
        let id = queue
            .enqueue("emails", serde_json::json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        queue.try_dequeue(&["emails"]).await.unwrap().unwrap();

        let scheduler = Scheduler::new(queue.clone(), SchedulerConfig::default());
        assert_eq!(scheduler.tick().await.unwrap().reaped, 0);

        clock.advance(Duration::from_secs(6));
        assert_eq!(scheduler.tick().await.unwrap().reaped, 1);
        let TaskLookup::Delayed { task, .. } = queue.get_task_status(&id).await.unwrap() else {
            panic!("expected reaped task to wait for its retry");
        };
        assert_eq!(task.last_error().unwrap().message, crate::queue::VISIBILITY_EXPIRED);
    }

    #[tokio::test]
    async fn test_leader_election_skips_followers() {
        let (queue, clock, store) = setup(QueueConfig::default());
        let config = SchedulerConfig::default().with_leader_election(Duration::from_secs(5));
        let leader = Scheduler::new(queue.clone(), config.clone());
        let follower = Scheduler::new(queue.clone(), config);

        assert!(!leader.tick().await.unwrap().skipped);
        assert!(follower.tick().await.unwrap().skipped);
        assert!(follower.last_tick().is_none());
        assert!(!leader.tick().await.unwrap().skipped);

        clock.advance(Duration::from_secs(6));
        assert!(!follower.tick().await.unwrap().skipped);
        assert!(leader.tick().await.unwrap().skipped);
        assert!(!store
            .try_acquire_lease(LEADER_LEASE, leader.holder(), Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_spawned_loop_runs_until_cancelled() {
        let (queue, clock, _) = setup(QueueConfig::default());
        let id = queue
            .enqueue(
                "emails",
                serde_json::json!({}),
                EnqueueOptions::new().with_delay(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            SchedulerConfig::default().with_tick_interval(Duration::from_millis(10)),
        ));
        let shutdown = CancellationToken::new();
        let handle = scheduler.clone().spawn(shutdown.clone());

        let mut promoted = false;
        for _ in 0..100 {
            if matches!(
                queue.get_task_status(&id).await.unwrap(),
                TaskLookup::Pending(_)
            ) {
                promoted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(promoted);
        assert!(scheduler.is_alive());
        assert!(scheduler.last_tick().is_some());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_alive());
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_tick_refreshes_depth_gauges() {
        use crate::metrics::{metric_names, QueueMetrics};

        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let metrics = QueueMetrics::local();
        let queue = Arc::new(
            TaskQueue::new(store, QueueConfig::default())
                .with_clock(clock)
                .with_metrics(metrics.clone()),
        );
        for _ in 0..3 {
            queue
                .enqueue("emails", serde_json::json!({}), EnqueueOptions::new())
                .await
                .unwrap();
        }

        Scheduler::new(queue, SchedulerConfig::default())
            .tick()
            .await
            .unwrap();
        let name = format!("{}.emails", metric_names::QUEUE_PENDING);
        assert_eq!(metrics.backend().get_gauge(&name).await, Some(3.0));
    }
}
