//! Dead-letter administration
//!
//! Tasks that exhaust their retries are parked in the queue's dead-letter
//! set with their full failure history. They stay there until an operator
//! requeues or purges them.

use crate::clock::{from_score, score_of};
use crate::error::{Result, TaskQueueError};
use crate::event::{events, QueueEvent};
use crate::queue::TaskQueue;
use crate::store::Move;
use crate::task::{Task, TaskError, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const PURGE_BATCH: usize = 100;

/// A permanently failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub queue: String,
    pub kind: Option<String>,
    pub payload: serde_json::Value,
    /// Final error
    pub error: Option<TaskError>,
    /// Every recorded failure, oldest first
    pub failures: Vec<TaskError>,
    /// Attempts made
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    fn from_task(task: Task, failed_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            queue: task.queue,
            kind: task.kind,
            payload: task.payload,
            error: task.failures.last().cloned(),
            failures: task.failures,
            attempts: task.attempt,
            failed_at,
        }
    }
}

impl TaskQueue {
    /// Dead letters of `queue`, oldest failure first
    pub async fn dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        let entries = self
            .store
            .range(&self.store.keys().dead(queue), offset, limit)
            .await?;

        let mut letters = Vec::with_capacity(entries.len());
        for (id, score) in entries {
            match self.store.get_task(&id).await? {
                Some(task) => {
                    let failed_at = task
                        .last_error()
                        .map(|e| e.failed_at)
                        .or_else(|| from_score(score))
                        .unwrap_or(task.created_at);
                    letters.push(DeadLetter::from_task(task, failed_at));
                }
                None => tracing::warn!(task_id = %id, queue = %queue, "dead letter without record"),
            }
        }
        Ok(letters)
    }

    pub async fn dead_letter_count(&self, queue: &str) -> Result<usize> {
        self.store.card(&self.store.keys().dead(queue)).await
    }

    /// Put a dead letter back into its pending tier.
    ///
    /// The task keeps its attempt count and history and gets a fresh budget
    /// of the queue's `max_attempts`. Its failure result is deleted. Returns
    /// `false` when the task is not dead-lettered.
    pub async fn requeue_dead_letter(&self, id: &TaskId) -> Result<bool> {
        let Some(task) = self.store.get_task(id).await? else {
            return Err(TaskQueueError::TaskNotFound(id.to_string()));
        };
        let keys = self.store.keys();
        let queue = task.queue.as_str();
        let now = self.clock.now();
        let budget = self.config.policy_for(queue).max_attempts;

        let mut next = task.clone();
        next.status = TaskStatus::Pending;
        next.max_attempts = next.attempt.saturating_add(budget);
        next.scheduled_at = None;
        next.visible_after = None;
        let tier = task.priority.min(self.config.priority_tiers.saturating_sub(1));

        let mv = Move::new(*id, keys.dead(queue))
            .to(keys.pending(queue, tier), score_of(now))
            .put_task(next.clone(), None)
            .delete_result();
        if !self.store.atomic_move(mv).await? {
            return Ok(false);
        }

        tracing::info!(
            task_id = %id,
            queue = %queue,
            attempt = next.attempt,
            max_attempts = next.max_attempts,
            "taskq.dead_letter: requeued"
        );
        self.events
            .emit(QueueEvent::for_task(events::TASK_REQUEUED, &next, []));
        Ok(true)
    }

    /// Drop one dead letter with its record and result
    pub async fn purge_dead_letter(&self, id: &TaskId) -> Result<bool> {
        let Some(task) = self.store.get_task(id).await? else {
            return Ok(false);
        };
        let mv = Move::new(*id, self.store.keys().dead(&task.queue))
            .delete_task()
            .delete_result();
        self.store.atomic_move(mv).await
    }

    /// Drop every dead letter of `queue`; returns how many were removed
    pub async fn purge_dead_letters(&self, queue: &str) -> Result<usize> {
        let dead = self.store.keys().dead(queue);
        let mut purged = 0;
        loop {
            let batch = self.store.range(&dead, 0, PURGE_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            for (id, _) in batch {
                let mv = Move::new(id, dead.as_str()).delete_task().delete_result();
                if self.store.atomic_move(mv).await? {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            tracing::info!(queue = %queue, purged, "taskq.dead_letter: purged");
        }
        Ok(purged)
    }
}
