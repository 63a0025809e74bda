//! Service, queue, scheduler and worker configuration
//!
//! Every struct deserializes with defaults for missing fields, and durations
//! are written as integer milliseconds.

use crate::error::{Result, TaskQueueError};
use crate::retry::RetryPolicy;
use crate::task::{priorities, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Backend selection, fixed at construction time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local store; no persistence
    Memory,
    /// Shared Redis store for multi-process deployments
    Distributed {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

fn default_namespace() -> String {
    "taskq".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory
    }
}

impl BackendConfig {
    /// Redis backend under the default namespace
    pub fn distributed(url: impl Into<String>) -> Self {
        BackendConfig::Distributed {
            url: url.into(),
            namespace: default_namespace(),
        }
    }
}

/// Per-queue overrides of the queue defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_serde")]
    pub visibility_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_serde")]
    pub backoff_base: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_serde")]
    pub max_backoff: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<bool>,
}

/// Effective settings for one queue after applying overrides
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePolicy {
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub dead_letter: bool,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of pending tiers per queue (tier 0 dequeues first)
    pub priority_tiers: u8,
    /// Tier used when the caller does not pick one
    pub default_priority: Priority,
    /// How long a claimed task stays invisible to other workers
    #[serde(with = "duration_ms")]
    pub visibility_timeout: Duration,
    /// Default retry ceiling
    pub max_attempts: u32,
    /// Default base for `backoff_base * 2^attempt`
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    /// Cap on the retry delay
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Retention of terminal results and finished task records
    #[serde(with = "duration_ms")]
    pub result_ttl: Duration,
    /// Park exhausted tasks in the dead-letter set (otherwise mark them failed)
    pub dead_letter: bool,
    /// Poll interval of a blocking `dequeue`
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Per-queue overrides
    pub overrides: HashMap<String, QueueOverrides>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_tiers: 3,
            default_priority: priorities::NORMAL,
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            result_ttl: Duration::from_secs(24 * 60 * 60),
            dead_letter: true,
            poll_interval: Duration::from_millis(100),
            overrides: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Set the number of priority tiers (builder pattern)
    pub fn with_priority_tiers(mut self, tiers: u8) -> Self {
        self.priority_tiers = tiers;
        self
    }

    /// Set the default priority (builder pattern)
    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Set visibility timeout (builder pattern)
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set default retry ceiling (builder pattern)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set backoff base and cap (builder pattern)
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.max_backoff = max;
        self
    }

    /// Set result retention (builder pattern)
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Enable or disable dead-lettering (builder pattern)
    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    /// Set dequeue poll interval (builder pattern)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Add per-queue overrides (builder pattern)
    pub fn with_overrides(mut self, queue: impl Into<String>, overrides: QueueOverrides) -> Self {
        self.overrides.insert(queue.into(), overrides);
        self
    }

    /// Resolve the effective settings for `queue`
    pub fn policy_for(&self, queue: &str) -> QueuePolicy {
        let o = self.overrides.get(queue);
        QueuePolicy {
            visibility_timeout: o
                .and_then(|o| o.visibility_timeout)
                .unwrap_or(self.visibility_timeout),
            max_attempts: o
                .and_then(|o| o.max_attempts)
                .unwrap_or(self.max_attempts),
            backoff_base: o
                .and_then(|o| o.backoff_base)
                .unwrap_or(self.backoff_base),
            max_backoff: o.and_then(|o| o.max_backoff).unwrap_or(self.max_backoff),
            dead_letter: o.and_then(|o| o.dead_letter).unwrap_or(self.dead_letter),
        }
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.priority_tiers == 0 {
            return Err(TaskQueueError::ConfigError(
                "priority_tiers must be at least 1".to_string(),
            ));
        }
        if self.default_priority >= self.priority_tiers {
            return Err(TaskQueueError::ConfigError(format!(
                "default_priority {} is outside {} tiers",
                self.default_priority, self.priority_tiers
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(TaskQueueError::ConfigError(
                "poll_interval must be positive".to_string(),
            ));
        }
        let queues = std::iter::once(("<default>", self.policy_for("")))
            .chain(self.overrides.keys().map(|q| (q.as_str(), self.policy_for(q))));
        for (queue, policy) in queues {
            if policy.max_attempts == 0 {
                return Err(TaskQueueError::ConfigError(format!(
                    "max_attempts must be at least 1 for queue {}",
                    queue
                )));
            }
            if policy.visibility_timeout.is_zero() {
                return Err(TaskQueueError::ConfigError(format!(
                    "visibility_timeout must be positive for queue {}",
                    queue
                )));
            }
        }
        Ok(())
    }
}

/// Promoter/reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between ticks
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Maximum entries promoted (and reaped) per queue per tick
    pub batch_size: usize,
    /// Only run ticks while holding the scheduler lease
    pub leader_election: bool,
    /// Lease lifetime; renewed on every tick
    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            batch_size: 100,
            leader_election: false,
            lease_ttl: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Set tick interval (builder pattern)
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set batch size (builder pattern)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable leader election (builder pattern)
    pub fn with_leader_election(mut self, lease_ttl: Duration) -> Self {
        self.leader_election = true;
        self.lease_ttl = lease_ttl;
        self
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run workers in this process
    pub enabled: bool,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Queues to poll, in precedence order; empty means every registered
    /// handler name. Handlers registered under a task kind rather than a
    /// queue name are only reached when their queue is listed here.
    pub queues: Vec<String>,
    /// How long one dequeue waits for work
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
    /// Time in-flight handlers get to finish on shutdown
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Per-execution handler timeout
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_serde")]
    pub handler_timeout: Option<Duration>,
    /// Delay before a task with no handler becomes visible again
    #[serde(with = "duration_ms")]
    pub release_delay: Duration,
    /// Backoff applied when the store is unavailable
    pub store_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: num_cpus::get().max(1),
            queues: Vec::new(),
            wait_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            handler_timeout: None,
            release_delay: Duration::from_secs(5),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Worker config with an explicit concurrency
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Set queues to poll (builder pattern)
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set dequeue wait timeout (builder pattern)
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set shutdown grace period (builder pattern)
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set handler timeout (builder pattern)
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Set release delay for unroutable tasks (builder pattern)
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Set the store retry policy (builder pattern)
    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    /// Producer-only: no workers in this process (builder pattern)
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub backend: BackendConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub workers: WorkerConfig,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            workers: WorkerConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl ServiceConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ServiceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set backend (builder pattern)
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Set queue config (builder pattern)
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set scheduler config (builder pattern)
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set worker config (builder pattern)
    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    /// Check every section for inconsistent values
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.scheduler.tick_interval.is_zero() {
            return Err(TaskQueueError::ConfigError(
                "scheduler tick_interval must be positive".to_string(),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(TaskQueueError::ConfigError(
                "scheduler batch_size must be at least 1".to_string(),
            ));
        }
        if self.scheduler.leader_election && self.scheduler.lease_ttl <= self.scheduler.tick_interval
        {
            return Err(TaskQueueError::ConfigError(
                "scheduler lease_ttl must exceed tick_interval".to_string(),
            ));
        }
        if self.workers.enabled && self.workers.concurrency == 0 {
            return Err(TaskQueueError::ConfigError(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(TaskQueueError::ConfigError(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if let BackendConfig::Distributed { url, .. } = &self.backend {
            if url.is_empty() {
                return Err(TaskQueueError::ConfigError(
                    "distributed backend requires a url".to_string(),
                ));
            }
        }
        Ok(())
    }
}
