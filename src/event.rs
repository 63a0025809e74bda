//! Task lifecycle notifications
//!
//! Every state transition the engine performs is published as a
//! [`QueueEvent`] on a broadcast channel. Publishing never blocks and never
//! fails: with no subscribers, or with a lagging subscriber, events are
//! dropped for that subscriber only.

use crate::task::Task;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Queue event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Event key (e.g., "taskq.task.enqueued")
    pub key: EventKey,

    pub payload: EventPayload,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl QueueEvent {
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event with a string payload
    pub fn with_string(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(key, EventPayload::String(message.into()))
    }

    /// Create an event with a map payload
    pub fn with_map(key: impl Into<String>, map: HashMap<String, serde_json::Value>) -> Self {
        Self::new(key, EventPayload::Map(map))
    }

    /// Event about one task: `task_id`, `queue`, `priority` and `attempt`,
    /// plus any `extra` fields
    pub fn for_task<I>(key: impl Into<String>, task: &Task, extra: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, serde_json::Value)>,
    {
        let mut map = HashMap::new();
        map.insert("task_id".to_string(), serde_json::json!(task.id.to_string()));
        map.insert("queue".to_string(), serde_json::json!(task.queue));
        map.insert("priority".to_string(), serde_json::json!(task.priority));
        map.insert("attempt".to_string(), serde_json::json!(task.attempt));
        if let Some(kind) = &task.kind {
            map.insert("kind".to_string(), serde_json::json!(kind));
        }
        for (field, value) in extra {
            map.insert(field.to_string(), value);
        }
        Self::with_map(key, map)
    }

    /// Field of a map payload
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Map(map) => map.get(name),
            _ => None,
        }
    }
}

/// Broadcast publisher shared by the queue, scheduler and workers
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish an event; dropped when nobody listens
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribe to filtered events as an `EventStream` (implements `Stream`)
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&QueueEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<QueueEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to all events as an `EventStream`
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }

    /// Subscribe to the events of a single queue
    pub fn subscribe_queue(&self, queue: impl Into<String>) -> EventStream {
        let queue = serde_json::Value::String(queue.into());
        self.subscribe_filtered(move |e| e.field("queue") == Some(&queue))
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Stream of [`QueueEvent`]s.
///
/// Lagged events are skipped silently. Use `.next().await` via `StreamExt`
/// or the [`EventStream::recv`] shorthand.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = QueueEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = QueueEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog
pub mod events {
    pub const TASK_ENQUEUED: &str = "taskq.task.enqueued";
    pub const TASK_DEQUEUED: &str = "taskq.task.dequeued";
    pub const TASK_COMPLETED: &str = "taskq.task.completed";
    pub const TASK_FAILED: &str = "taskq.task.failed";
    pub const TASK_RETRY_SCHEDULED: &str = "taskq.task.retry_scheduled";
    pub const TASK_DEAD_LETTERED: &str = "taskq.task.dead_lettered";
    /// Claim deadline passed; the scheduler took the task back
    pub const TASK_REAPED: &str = "taskq.task.reaped";
    /// Delayed task moved to its pending tier
    pub const TASK_PROMOTED: &str = "taskq.task.promoted";
    pub const TASK_CANCELLED: &str = "taskq.task.cancelled";
    /// Claimed task handed back without counting as a failure
    pub const TASK_RELEASED: &str = "taskq.task.released";
    /// Dead letter put back into its queue
    pub const TASK_REQUEUED: &str = "taskq.task.requeued";
    pub const SERVICE_STARTED: &str = "taskq.service.started";
    pub const SERVICE_STOPPED: &str = "taskq.service.stopped";
}
