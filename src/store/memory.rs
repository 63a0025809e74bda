//! In-memory store backend
//!
//! All structures sit behind one `tokio::sync::Mutex`, so every primitive is
//! trivially atomic within the process. Nothing is persisted.

use super::{ClaimCandidate, KeySpace, Move, RecordAction, ResultAction, Store, StoreOp};
use crate::clock::{offset, score_of, Clock, SystemClock};
use crate::error::Result;
use crate::task::{Task, TaskId, TaskResult, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Minimum clock time between two sweeps of expired entries
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sorted set ordered by `(score, insertion sequence)`
#[derive(Debug, Default)]
struct SortedSet {
    members: HashMap<TaskId, (i64, u64)>,
    order: BTreeSet<(i64, u64, TaskId)>,
}

impl SortedSet {
    fn insert(&mut self, id: TaskId, score: i64, seq: u64) {
        if let Some((old_score, old_seq)) = self.members.insert(id, (score, seq)) {
            self.order.remove(&(old_score, old_seq, id));
        }
        self.order.insert((score, seq, id));
    }

    fn remove(&mut self, id: &TaskId) -> Option<i64> {
        let (score, seq) = self.members.remove(id)?;
        self.order.remove(&(score, seq, *id));
        Some(score)
    }

    fn score(&self, id: &TaskId) -> Option<i64> {
        self.members.get(id).map(|(score, _)| *score)
    }

    fn pop_first(&mut self) -> Option<TaskId> {
        let first = *self.order.iter().next()?;
        self.order.remove(&first);
        self.members.remove(&first.2);
        Some(first.2)
    }

    fn range_by_score(&self, max_score: i64, limit: usize) -> Vec<(TaskId, i64)> {
        self.order
            .iter()
            .take_while(|(score, _, _)| *score <= max_score)
            .take(limit)
            .map(|(score, _, id)| (*id, *score))
            .collect()
    }

    fn range(&self, offset: usize, limit: usize) -> Vec<(TaskId, i64)> {
        self.order
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(score, _, id)| (*id, *score))
            .collect()
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Expiring<T> {
    fn new(value: T, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| offset(now, ttl)),
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    sets: HashMap<String, SortedSet>,
    tasks: HashMap<TaskId, Expiring<Task>>,
    results: HashMap<TaskId, Expiring<TaskResult>>,
    queues: BTreeSet<String>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    seq: u64,
    next_sweep: Option<DateTime<Utc>>,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn add(&mut self, key: &str, id: TaskId, score: i64) {
        let seq = self.next_seq();
        self.sets.entry(key.to_string()).or_default().insert(id, score, seq);
    }

    fn remove(&mut self, key: &str, id: &TaskId) -> Option<i64> {
        let set = self.sets.get_mut(key)?;
        let score = set.remove(id);
        if set.len() == 0 {
            self.sets.remove(key);
        }
        score
    }

    /// Drop expired records and results; returns how many were removed
    fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        if self.next_sweep.is_some_and(|at| at > now) {
            return 0;
        }
        self.next_sweep = Some(offset(now, SWEEP_INTERVAL));

        let before = self.tasks.len() + self.results.len();
        self.tasks.retain(|_, entry| entry.is_live(now));
        self.results.retain(|_, entry| entry.is_live(now));
        before - self.tasks.len() - self.results.len()
    }

    fn task(&mut self, id: &TaskId, now: DateTime<Utc>) -> Option<&mut Task> {
        if !self.tasks.get(id)?.is_live(now) {
            self.tasks.remove(id);
            return None;
        }
        self.tasks.get_mut(id).map(|entry| &mut entry.value)
    }

    fn put_task(&mut self, task: Task, now: DateTime<Utc>, ttl: Option<Duration>) {
        self.tasks.insert(task.id, Expiring::new(task, now, ttl));
    }

    fn put_result(&mut self, result: TaskResult, now: DateTime<Utc>, ttl: Duration) {
        self.results
            .insert(result.task_id, Expiring::new(result, now, Some(ttl)));
    }

    fn apply(&mut self, op: StoreOp, now: DateTime<Utc>) {
        match op {
            StoreOp::PutTask { task, ttl } => self.put_task(task, now, ttl),
            StoreOp::DeleteTask(id) => {
                self.tasks.remove(&id);
            }
            StoreOp::Add { key, id, score } => self.add(&key, id, score),
            StoreOp::Remove { key, id } => {
                self.remove(&key, &id);
            }
            StoreOp::PutResult { result, ttl } => self.put_result(result, now, ttl),
            StoreOp::DeleteResult(id) => {
                self.results.remove(&id);
            }
            StoreOp::TrackQueue(queue) => {
                self.queues.insert(queue);
            }
        }
    }
}

fn sweep(state: &mut State, now: DateTime<Utc>) {
    let swept = state.sweep_expired(now);
    if swept > 0 {
        tracing::debug!(swept, "taskq.store: dropped expired records");
    }
}

/// Process-local [`Store`]
pub struct MemoryStore {
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose TTLs follow `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: KeySpace::default(),
            clock,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn write_multi(&self, ops: Vec<StoreOp>) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        sweep(&mut state, now);
        for op in ops {
            state.apply(op, now);
        }
        Ok(())
    }

    async fn atomic_move(&self, mv: Move) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        sweep(&mut state, now);

        let current = state.sets.get(&mv.from).and_then(|set| set.score(&mv.id));
        let Some(score) = current else {
            return Ok(false);
        };
        if mv.expect_score.is_some_and(|expected| expected != score) {
            return Ok(false);
        }

        state.remove(&mv.from, &mv.id);
        if let Some((key, score)) = &mv.to {
            state.add(key, mv.id, *score);
        }
        match mv.record {
            RecordAction::Keep => {}
            RecordAction::Put { task, ttl } => state.put_task(task, now, ttl),
            RecordAction::Delete => {
                state.tasks.remove(&mv.id);
            }
        }
        match mv.result {
            ResultAction::Keep => {}
            ResultAction::Put { result, ttl } => state.put_result(result, now, ttl),
            ResultAction::Delete => {
                state.results.remove(&mv.id);
            }
        }
        Ok(true)
    }

    async fn pop_highest_priority(&self, candidates: &[ClaimCandidate]) -> Result<Option<Task>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        for candidate in candidates {
            loop {
                let popped = state
                    .sets
                    .get_mut(&candidate.pending)
                    .and_then(|set| set.pop_first());
                let Some(id) = popped else {
                    break;
                };
                let claimed = state.task(&id, now).map(|task| {
                    task.status = TaskStatus::Processing;
                    task.attempt = task.attempt.saturating_add(1);
                    task.visible_after = Some(candidate.visible_after);
                    task.clone()
                });
                let Some(task) = claimed else {
                    // orphan id: the record expired or was deleted
                    continue;
                };
                state.add(
                    &candidate.processing,
                    id,
                    score_of(candidate.visible_after),
                );
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn read_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(TaskId, i64)>> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.range_by_score(max_score, limit))
            .unwrap_or_default())
    }

    async fn range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<(TaskId, i64)>> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.range(offset, limit))
            .unwrap_or_default())
    }

    async fn score(&self, key: &str, id: &TaskId) -> Result<Option<i64>> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).and_then(|set| set.score(id)))
    }

    async fn card(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.sets.get(key).map_or(0, SortedSet::len))
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.task(id, now).map(|task| task.clone()))
    }

    async fn get_result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let live = state.results.get(id).map(|entry| entry.is_live(now));
        match live {
            Some(true) => Ok(state.results.get(id).map(|entry| entry.value.clone())),
            Some(false) => {
                state.results.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.queues.iter().cloned().collect())
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some((current, expires_at)) = state.leases.get(name) {
            if current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        state
            .leases
            .insert(name.to_string(), (holder.to_string(), offset(now, ttl)));
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
