//! Store adapter: the single shared mutable resource of the engine
//!
//! Every state transition of a task is expressed through one of four atomic
//! primitives:
//!
//! - [`Store::atomic_move`]: conditional move of an id between sorted sets,
//!   rewriting the task record and result in the same step
//! - [`Store::pop_highest_priority`]: claim the first item of the first
//!   non-empty pending key
//! - [`Store::read_range_by_score`]: scan a time-ordered set up to a score
//! - [`Store::write_multi`]: batched write applied all-or-nothing
//!
//! Nothing else in the crate performs read-then-write against shared state.
//! Scores are integer milliseconds since the Unix epoch.

pub mod memory;
#[cfg(feature = "distributed")]
pub mod redis;

use crate::config::BackendConfig;
use crate::error::Result;
#[cfg(not(feature = "distributed"))]
use crate::error::TaskQueueError;
use crate::task::{Priority, Task, TaskId, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryStore;
#[cfg(feature = "distributed")]
pub use self::redis::RedisStore;

/// Key layout shared by all backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("taskq")
    }
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Pending set for one priority tier
    pub fn pending(&self, queue: &str, priority: Priority) -> String {
        format!("{}:queue:{}:pending:{}", self.prefix, queue, priority)
    }

    /// Delayed set, scored by `scheduled_at`
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.prefix, queue)
    }

    /// Processing set, scored by claim deadline
    pub fn processing(&self, queue: &str) -> String {
        format!("{}:queue:{}:processing", self.prefix, queue)
    }

    /// Dead-letter set, scored by failure time
    pub fn dead(&self, queue: &str) -> String {
        format!("{}:queue:{}:dead", self.prefix, queue)
    }

    /// Task record
    pub fn task(&self, id: &TaskId) -> String {
        format!("{}{}", self.task_prefix(), id)
    }

    pub fn task_prefix(&self) -> String {
        format!("{}:task:", self.prefix)
    }

    /// Terminal result
    pub fn result(&self, id: &TaskId) -> String {
        format!("{}:result:{}", self.prefix, id)
    }

    /// Set of known queue names
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    /// Named lease
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }
}

/// One step of a [`Store::write_multi`] batch
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Write the task record; `ttl` expires it, `None` keeps it forever
    PutTask { task: Task, ttl: Option<Duration> },
    DeleteTask(TaskId),
    /// Add (or re-score) an id in a sorted set
    Add { key: String, id: TaskId, score: i64 },
    Remove { key: String, id: TaskId },
    PutResult { result: TaskResult, ttl: Duration },
    DeleteResult(TaskId),
    /// Register a queue name so the scheduler and health checks find it
    TrackQueue(String),
}

/// What an [`atomic_move`](Store::atomic_move) does to the task record
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RecordAction {
    #[default]
    Keep,
    Put {
        task: Task,
        ttl: Option<Duration>,
    },
    Delete,
}

/// What an [`atomic_move`](Store::atomic_move) does to the task result
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResultAction {
    #[default]
    Keep,
    Put {
        result: TaskResult,
        ttl: Duration,
    },
    Delete,
}

/// A conditional move of one id out of `from`.
///
/// Applies only if `id` is in `from` (and, when `expect_score` is set, only if
/// its score matches). The removal, the insert into `to` and the record and
/// result actions happen as one indivisible step.
#[derive(Debug, Clone, PartialEq)]
pub struct Move {
    pub id: TaskId,
    pub from: String,
    pub expect_score: Option<i64>,
    pub to: Option<(String, i64)>,
    pub record: RecordAction,
    pub result: ResultAction,
}

impl Move {
    pub fn new(id: TaskId, from: impl Into<String>) -> Self {
        Self {
            id,
            from: from.into(),
            expect_score: None,
            to: None,
            record: RecordAction::Keep,
            result: ResultAction::Keep,
        }
    }

    /// Only move if the current score equals `score`
    pub fn expect(mut self, score: i64) -> Self {
        self.expect_score = Some(score);
        self
    }

    /// Destination set and score
    pub fn to(mut self, key: impl Into<String>, score: i64) -> Self {
        self.to = Some((key.into(), score));
        self
    }

    /// Rewrite the task record
    pub fn put_task(mut self, task: Task, ttl: Option<Duration>) -> Self {
        self.record = RecordAction::Put { task, ttl };
        self
    }

    pub fn delete_task(mut self) -> Self {
        self.record = RecordAction::Delete;
        self
    }

    /// Write the terminal result
    pub fn put_result(mut self, result: TaskResult, ttl: Duration) -> Self {
        self.result = ResultAction::Put { result, ttl };
        self
    }

    pub fn delete_result(mut self) -> Self {
        self.result = ResultAction::Delete;
        self
    }
}

/// One pending key to try during a claim, and where the claimed id goes
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimCandidate {
    pub pending: String,
    pub processing: String,
    /// Claim deadline written to the record and used as processing score
    pub visible_after: DateTime<Utc>,
}

/// Backend-agnostic store contract
#[async_trait]
pub trait Store: Send + Sync {
    /// Key layout of this store
    fn keys(&self) -> &KeySpace;

    /// Backend name for health reports
    fn backend_name(&self) -> &'static str;

    /// Batched write, applied all-or-nothing
    async fn write_multi(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Conditional move; `false` when the id was not in `from` (or the score differed)
    async fn atomic_move(&self, mv: Move) -> Result<bool>;

    /// Claim the lowest-scored id of the first non-empty pending key.
    ///
    /// The claimed id moves to the candidate's processing set with score
    /// `visible_after`; the record gets `status=Processing`, `attempt += 1`
    /// and `visible_after`. Ids without a record are discarded.
    async fn pop_highest_priority(&self, candidates: &[ClaimCandidate]) -> Result<Option<Task>>;

    /// Ids with score `<= max_score`, lowest first, at most `limit`
    async fn read_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(TaskId, i64)>>;

    /// Ids by rank, lowest score first
    async fn range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<(TaskId, i64)>>;

    /// Score of `id` in `key`
    async fn score(&self, key: &str, id: &TaskId) -> Result<Option<i64>>;

    /// Number of ids in `key`
    async fn card(&self, key: &str) -> Result<usize>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    async fn get_result(&self, id: &TaskId) -> Result<Option<TaskResult>>;

    /// All queue names ever enqueued to, sorted
    async fn queues(&self) -> Result<Vec<String>>;

    /// Acquire or renew the lease `name` for `holder`
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Round-trip check
    async fn ping(&self) -> Result<()>;
}

/// Construct the store selected by `config`
pub async fn connect(config: &BackendConfig) -> Result<Arc<dyn Store>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "distributed")]
        BackendConfig::Distributed { url, namespace } => {
            let store = RedisStore::connect(url, KeySpace::new(namespace.clone())).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "distributed"))]
        BackendConfig::Distributed { .. } => Err(TaskQueueError::ConfigError(
            "distributed backend requires the `distributed` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("app");
        let id: TaskId = "0190a5a4-7a51-7c0e-9b1e-6c2f1a0d4e11".parse().unwrap();

        assert_eq!(keys.pending("emails", 0), "app:queue:emails:pending:0");
        assert_eq!(keys.delayed("emails"), "app:queue:emails:delayed");
        assert_eq!(keys.processing("emails"), "app:queue:emails:processing");
        assert_eq!(keys.dead("emails"), "app:queue:emails:dead");
        assert_eq!(
            keys.task(&id),
            "app:task:0190a5a4-7a51-7c0e-9b1e-6c2f1a0d4e11"
        );
        assert_eq!(
            keys.result(&id),
            "app:result:0190a5a4-7a51-7c0e-9b1e-6c2f1a0d4e11"
        );
        assert_eq!(keys.queues(), "app:queues");
        assert_eq!(keys.lock("scheduler"), "app:lock:scheduler");
    }

    #[test]
    fn test_move_builder() {
        let id = TaskId::new();
        let mv = Move::new(id, "from").expect(42).to("to", 7).delete_task();
        assert_eq!(mv.expect_score, Some(42));
        assert_eq!(mv.to, Some(("to".to_string(), 7)));
        assert_eq!(mv.record, RecordAction::Delete);
        assert_eq!(mv.result, ResultAction::Keep);
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let store = connect(&BackendConfig::Memory).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
        assert!(store.ping().await.is_ok());
    }
}
