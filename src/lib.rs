//! # A3S TaskQ
//!
//! A distributed task queue engine: producers enqueue JSON payloads into
//! named queues, workers in one or many processes claim and execute them.
//!
//! ## Core (always compiled)
//!
//! - Priority tiers per queue, strict between tiers and FIFO within one
//! - Delayed tasks, promoted by the scheduler once due
//! - Visibility timeouts with at-least-once redelivery of lost claims
//! - Retries with exponential backoff and a dead-letter set
//! - Terminal results retained for a configurable TTL
//! - Pluggable `Store` trait with an in-memory backend
//! - Worker pool with per-kind handler routing and graceful shutdown
//! - Event system for task lifecycle notifications
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `metrics` | ✅ | — | `MetricsBackend` trait, `LocalMetrics`, latency histograms |
//! | `telemetry` | ✅ | `opentelemetry`, `dashmap` | OpenTelemetry recorder and `OtelMetricsBackend` |
//! | `distributed` | ✅ | `redis` | `RedisStore`, shared by every process of a deployment |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_taskq::{EnqueueOptions, ServiceConfig, TaskContext, TaskQueueService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = TaskQueueService::builder(ServiceConfig::default())
//!         .with_handler_fn("emails", |ctx: TaskContext| async move {
//!             println!("sending to {}", ctx.payload()["to"]);
//!             Ok(serde_json::json!({"sent": true}))
//!         })
//!         .build()
//!         .await?;
//!
//!     service.start().await?;
//!     let id = service
//!         .enqueue("emails", serde_json::json!({"to": "a@example.com"}), EnqueueOptions::new())
//!         .await?;
//!     println!("status: {:?}", service.get_task_status(&id).await?.status());
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

// Core modules (always compiled)
pub mod clock;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

// Feature-gated modules
#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "telemetry")]
pub mod telemetry;

// Core re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BackendConfig, QueueConfig, QueueOverrides, QueuePolicy, SchedulerConfig, ServiceConfig,
    WorkerConfig,
};
pub use dlq::DeadLetter;
pub use error::{Result, TaskQueueError};
pub use event::{events, EventEmitter, EventPayload, EventStream, QueueEvent};
pub use queue::{Completion, FailOutcome, QueueDepth, TaskLookup, TaskQueue};
pub use registry::{FnHandler, HandlerRegistry, TaskContext, TaskHandler};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, TickReport};
pub use service::{HealthReport, TaskQueueService, TaskQueueServiceBuilder, WorkerHealth};
pub use store::{KeySpace, MemoryStore, Store};
pub use task::{
    priorities, EnqueueOptions, HandlerError, Priority, ResultStatus, Task, TaskError, TaskId,
    TaskResult, TaskStatus,
};
pub use worker::WorkerPool;

// Feature-gated re-exports
#[cfg(feature = "metrics")]
pub use metrics::{
    metric_names, HistogramPercentiles, HistogramStats, LocalMetrics, MetricsBackend,
    MetricsSnapshot, QueueMetrics,
};
#[cfg(feature = "metrics")]
pub use service::MetricsReport;
#[cfg(feature = "distributed")]
pub use store::RedisStore;
#[cfg(feature = "telemetry")]
pub use telemetry::OtelMetricsBackend;
