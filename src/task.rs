//! Task records, results and enqueue options

use crate::config::duration_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Task priority (lower number = higher priority)
pub type Priority = u8;

/// Conventional priority tiers for the default three-tier layout
pub mod priorities {
    use super::Priority;

    pub const HIGH: Priority = 0;
    pub const NORMAL: Priority = 1;
    pub const LOW: Priority = 2;
}

/// Globally unique task identifier.
///
/// Backed by a UUIDv7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in a pending tier
    Pending,
    /// Waiting in the delayed set for `scheduled_at`
    Delayed,
    /// Claimed by a worker until `visible_after`
    Processing,
    /// Finished successfully
    Completed,
    /// Retries exhausted on a queue without dead-lettering
    Failed,
    /// Retries exhausted, parked in the dead-letter set
    DeadLettered,
    /// Removed by id before it was claimed
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will never run again without operator action
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::DeadLettered
                | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Delayed => "delayed",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead_lettered",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One recorded failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Human-readable message
    pub message: String,
    /// Optional structured detail supplied by the handler
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    /// Attempt number that failed
    pub attempt: u32,
    /// When the failure was recorded
    pub failed_at: DateTime<Utc>,
}

/// Failure reported by a handler (or by the engine on its behalf).
///
/// Handlers return this from [`crate::registry::TaskHandler::handle`]; any
/// error type that converts into it can be propagated with `?`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attach structured detail (builder pattern)
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub(crate) fn into_error(self, attempt: u32, failed_at: DateTime<Utc>) -> TaskError {
        TaskError {
            message: self.message,
            detail: self.detail,
            attempt,
            failed_at,
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid payload: {}", err))
    }
}

impl From<crate::error::TaskQueueError> for HandlerError {
    fn from(err: crate::error::TaskQueueError) -> Self {
        Self::new(err.to_string())
    }
}

/// A unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    /// Handler selector; falls back to the queue name when absent
    #[serde(default)]
    pub kind: Option<String>,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Due time of a delayed task or retry; kept after promotion
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Claim deadline, set together with the move to processing
    #[serde(default)]
    pub visible_after: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    /// Failure history, oldest first
    #[serde(default)]
    pub failures: Vec<TaskError>,
}

impl Task {
    /// Name the handler registry resolves first
    pub fn handler_key(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.queue)
    }

    /// Most recent failure, if any
    pub fn last_error(&self) -> Option<&TaskError> {
        self.failures.last()
    }

    /// Whether another attempt is allowed after the current one fails
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Outcome of a terminal result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: ResultStatus,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
    pub completed_at: DateTime<Utc>,
    pub attempt_at_completion: u32,
}

impl TaskResult {
    /// Successful result for a claimed task
    pub fn success(task: &Task, output: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            status: ResultStatus::Success,
            output: Some(output),
            error: None,
            completed_at: at,
            attempt_at_completion: task.attempt,
        }
    }

    /// Failed result carrying the final error
    pub fn failure(task: &Task, error: TaskError, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            status: ResultStatus::Failure,
            output: None,
            error: Some(error),
            completed_at: at,
            attempt_at_completion: task.attempt,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Per-task options for `enqueue`; unset fields fall back to queue settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub kind: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set priority tier (builder pattern)
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Delay visibility (builder pattern)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Override the retry ceiling (builder pattern)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the backoff base (builder pattern)
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = Some(backoff_base);
        self
    }

    /// Route to a handler by kind instead of queue name (builder pattern)
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}
