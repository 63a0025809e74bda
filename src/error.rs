//! Error types for the task queue engine
//!
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`TaskQueueError`] enum covers infrastructure and configuration failures:
//! - Invalid input (empty queue name, out-of-range priority)
//! - Store unavailability (network or backend down), which is retriable
//! - Configuration errors (missing handlers, inconsistent settings)
//! - Lifecycle errors (shutdown in progress)
//!
//! Handler failures are not errors of this type: they are task-level outcomes
//! that flow through [`crate::queue::TaskQueue::fail`]. Losing a claim race is
//! not an error either; it shows up as `None`, `false` or `FailOutcome::Stale`.
//!
//! # Example
//!
//! ```rust,ignore
//! use a3s_taskq::{TaskQueueError, EnqueueOptions};
//!
//! match service.enqueue("emails", payload, EnqueueOptions::new()).await {
//!     Ok(id) => println!("queued {}", id),
//!     Err(e) if e.is_retriable() => { /* back off and try again */ }
//!     Err(TaskQueueError::ShutdownInProgress) => eprintln!("service is stopping"),
//!     Err(e) => eprintln!("enqueue failed: {}", e),
//! }
//! ```

use thiserror::Error;

/// Task queue error type
///
/// # Variants
///
/// * `InvalidQueue` - Queue name is empty or malformed
/// * `InvalidPriority` - Priority is outside the configured tiers
/// * `ConfigError` - Invalid configuration
/// * `StoreUnavailable` - The backing store failed; callers may retry
/// * `Serialization` - A record could not be encoded or decoded
/// * `HandlerNotRegistered` - No handler for a queue or kind
/// * `Timeout` - An operation exceeded its deadline
/// * `ShutdownInProgress` - The service no longer accepts work
/// * `TaskNotFound` - The task id is unknown to the store
/// * `Other` - Catch-all for unexpected errors
#[derive(Error, Debug)]
pub enum TaskQueueError {
    /// Invalid queue name
    #[error("Invalid queue name: '{0}'")]
    InvalidQueue(String),

    /// Priority out of range
    #[error("Invalid priority {priority}: queue has {tiers} priority tiers")]
    InvalidPriority { priority: u8, tiers: u8 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Store unavailable
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Handler not registered
    #[error("No handler registered for '{0}'")]
    HandlerNotRegistered(String),

    /// Operation timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Shutdown in progress
    #[error("Service is shutting down, not accepting new tasks")]
    ShutdownInProgress,

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl TaskQueueError {
    /// Whether the caller may retry the same operation later.
    ///
    /// Only infrastructure failures are retriable; everything else needs a
    /// different input or configuration to succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TaskQueueError::StoreUnavailable(_))
    }
}

#[cfg(feature = "distributed")]
impl From<redis::RedisError> for TaskQueueError {
    fn from(err: redis::RedisError) -> Self {
        TaskQueueError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias using TaskQueueError
pub type Result<T> = std::result::Result<T, TaskQueueError>;
