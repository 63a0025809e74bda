//! Redis store backend
//!
//! Layout per queue: one sorted set per pending tier, plus delayed,
//! processing and dead sets. Task records are hashes whose fields hold the
//! JSON encoding of each `Task` field, so the claim script can update
//! `status`, `attempt` and `visible_after` in place. Results are JSON strings
//! expiring with `PX`.
//!
//! Claims and conditional moves run as Lua scripts; batched writes run as
//! `MULTI/EXEC` pipelines. The scripts derive task keys from the namespace
//! prefix, so this backend targets standalone Redis (or a single hash slot),
//! not a sharded cluster.

use super::{ClaimCandidate, KeySpace, Move, RecordAction, ResultAction, Store, StoreOp};
use crate::clock::score_of;
use crate::error::{Result, TaskQueueError};
use crate::task::{Task, TaskId, TaskResult, TaskStatus};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;

/// Claim the first id of the first non-empty pending key.
///
/// KEYS: pending1, processing1, pending2, processing2, ...
/// ARGV: task key prefix, status JSON, then per pair: deadline score, visible_after JSON.
const CLAIM_SCRIPT: &str = r#"
local prefix = ARGV[1]
for i = 1, #KEYS, 2 do
  local pair = (i + 1) / 2
  local deadline = ARGV[1 + pair * 2]
  local visible = ARGV[2 + pair * 2]
  while true do
    local ids = redis.call('ZRANGE', KEYS[i], 0, 0)
    if #ids == 0 then
      break
    end
    local id = ids[1]
    redis.call('ZREM', KEYS[i], id)
    local tkey = prefix .. id
    if redis.call('EXISTS', tkey) == 1 then
      redis.call('ZADD', KEYS[i + 1], deadline, id)
      redis.call('HSET', tkey, 'status', ARGV[2], 'visible_after', visible)
      redis.call('HINCRBY', tkey, 'attempt', 1)
      return redis.call('HGETALL', tkey)
    end
  end
end
return false
"#;

/// Conditional move with record and result rewrite.
///
/// KEYS: from, to, task key, result key
/// ARGV: id, expected score or '', destination score or '', record mode,
///       record ttl ms (0 = persist), result mode, result JSON, result ttl ms,
///       then record field/value pairs.
const MOVE_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return 0
end
if ARGV[2] ~= '' and tonumber(score) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
if ARGV[3] ~= '' then
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
end
if ARGV[4] == 'put' then
  redis.call('HSET', KEYS[3], unpack(ARGV, 9))
  if tonumber(ARGV[5]) > 0 then
    redis.call('PEXPIRE', KEYS[3], ARGV[5])
  else
    redis.call('PERSIST', KEYS[3])
  end
elseif ARGV[4] == 'delete' then
  redis.call('DEL', KEYS[3])
end
if ARGV[6] == 'put' then
  redis.call('SET', KEYS[4], ARGV[7], 'PX', ARGV[8])
elseif ARGV[6] == 'delete' then
  redis.call('DEL', KEYS[4])
end
return 1
"#;

/// Acquire or renew a named lease.
///
/// KEYS: lock key. ARGV: holder, ttl ms.
const LEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Encode a task as hash field/value pairs (each value is JSON)
pub(crate) fn encode_task(task: &Task) -> Result<Vec<(String, String)>> {
    match serde_json::to_value(task)? {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(field, value)| (field, value.to_string()))
            .collect()),
        other => Err(TaskQueueError::Other(format!(
            "task encoded as {} instead of an object",
            other
        ))),
    }
}

/// Decode a task hash written by [`encode_task`] and updated by the claim script
pub(crate) fn decode_task(fields: HashMap<String, String>) -> Result<Task> {
    let mut map = serde_json::Map::with_capacity(fields.len());
    for (field, raw) in fields {
        map.insert(field, serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_value(serde_json::Value::Object(map))?)
}

fn parse_members(raw: Vec<(String, f64)>) -> Vec<(TaskId, i64)> {
    raw.into_iter()
        .filter_map(|(member, score)| match member.parse::<TaskId>() {
            Ok(id) => Some((id, score as i64)),
            Err(_) => {
                tracing::warn!(member = %member, "ignoring malformed task id in sorted set");
                None
            }
        })
        .collect()
}

/// Redis-backed [`Store`]
pub struct RedisStore {
    keys: KeySpace,
    conn: ConnectionManager,
    claim: Script,
    mover: Script,
    lease: Script,
}

impl RedisStore {
    /// Connect to `url` and use `keys` as the layout
    pub async fn connect(url: &str, keys: KeySpace) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(namespace = %keys.prefix(), "Connected to Redis task store");
        Ok(Self::with_connection(conn, keys))
    }

    /// Wrap an existing connection manager
    pub fn with_connection(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            keys,
            conn,
            claim: Script::new(CLAIM_SCRIPT),
            mover: Script::new(MOVE_SCRIPT),
            lease: Script::new(LEASE_SCRIPT),
        }
    }

    fn queue_op(&self, pipe: &mut redis::Pipeline, op: StoreOp) -> Result<()> {
        match op {
            StoreOp::PutTask { task, ttl } => {
                let key = self.keys.task(&task.id);
                pipe.cmd("HSET").arg(&key).arg(encode_task(&task)?).ignore();
                match ttl {
                    Some(ttl) => pipe.cmd("PEXPIRE").arg(&key).arg(ttl_ms(ttl)).ignore(),
                    None => pipe.cmd("PERSIST").arg(&key).ignore(),
                };
            }
            StoreOp::DeleteTask(id) => {
                pipe.cmd("DEL").arg(self.keys.task(&id)).ignore();
            }
            StoreOp::Add { key, id, score } => {
                pipe.cmd("ZADD")
                    .arg(key)
                    .arg(score)
                    .arg(id.to_string())
                    .ignore();
            }
            StoreOp::Remove { key, id } => {
                pipe.cmd("ZREM").arg(key).arg(id.to_string()).ignore();
            }
            StoreOp::PutResult { result, ttl } => {
                pipe.cmd("SET")
                    .arg(self.keys.result(&result.task_id))
                    .arg(serde_json::to_string(&result)?)
                    .arg("PX")
                    .arg(ttl_ms(ttl))
                    .ignore();
            }
            StoreOp::DeleteResult(id) => {
                pipe.cmd("DEL").arg(self.keys.result(&id)).ignore();
            }
            StoreOp::TrackQueue(queue) => {
                pipe.cmd("SADD").arg(self.keys.queues()).arg(queue).ignore();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn write_multi(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            self.queue_op(&mut pipe, op)?;
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn atomic_move(&self, mv: Move) -> Result<bool> {
        let id = mv.id.to_string();
        let (to_key, to_score) = match &mv.to {
            Some((key, score)) => (key.clone(), score.to_string()),
            None => (mv.from.clone(), String::new()),
        };

        let (record_mode, record_ttl, fields) = match mv.record {
            RecordAction::Keep => ("keep", 0, Vec::new()),
            RecordAction::Put { task, ttl } => {
                ("put", ttl.map(ttl_ms).unwrap_or(0), encode_task(&task)?)
            }
            RecordAction::Delete => ("delete", 0, Vec::new()),
        };
        let (result_mode, result_json, result_ttl) = match mv.result {
            ResultAction::Keep => ("keep", String::new(), 0),
            ResultAction::Put { result, ttl } => {
                ("put", serde_json::to_string(&result)?, ttl_ms(ttl))
            }
            ResultAction::Delete => ("delete", String::new(), 0),
        };

        let mut invocation = self.mover.prepare_invoke();
        invocation
            .key(&mv.from)
            .key(&to_key)
            .key(self.keys.task(&mv.id))
            .key(self.keys.result(&mv.id))
            .arg(&id)
            .arg(mv.expect_score.map(|s| s.to_string()).unwrap_or_default())
            .arg(&to_score)
            .arg(record_mode)
            .arg(record_ttl)
            .arg(result_mode)
            .arg(&result_json)
            .arg(result_ttl)
            .arg(fields);

        let mut conn = self.conn.clone();
        let moved: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(moved == 1)
    }

    async fn pop_highest_priority(&self, candidates: &[ClaimCandidate]) -> Result<Option<Task>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut invocation = self.claim.prepare_invoke();
        invocation
            .arg(self.keys.task_prefix())
            .arg(serde_json::to_string(&TaskStatus::Processing)?);
        for candidate in candidates {
            invocation
                .key(&candidate.pending)
                .key(&candidate.processing)
                .arg(score_of(candidate.visible_after))
                .arg(serde_json::to_string(&candidate.visible_after)?);
        }

        let mut conn = self.conn.clone();
        let fields: Option<HashMap<String, String>> = invocation.invoke_async(&mut conn).await?;
        match fields {
            Some(fields) if !fields.is_empty() => Ok(Some(decode_task(fields)?)),
            _ => Ok(None),
        }
    }

    async fn read_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<(TaskId, i64)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(parse_members(raw))
    }

    async fn range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<(TaskId, i64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(offset)
            .arg(offset + limit - 1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(parse_members(raw))
    }

    async fn score(&self, key: &str, id: &TaskId) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(score.map(|s| s as i64))
    }

    async fn card(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.task(id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_task(fields).map(Some)
    }

    async fn get_result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.result(id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queues())
            .query_async(&mut conn)
            .await?;
        queues.sort();
        Ok(queues)
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut invocation = self.lease.prepare_invoke();
        invocation
            .key(self.keys.lock(name))
            .arg(holder)
            .arg(ttl_ms(ttl));
        let mut conn = self.conn.clone();
        let acquired: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(acquired == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
