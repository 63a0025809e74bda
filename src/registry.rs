//! Handler registry
//!
//! Handlers are registered under a name. A task resolves to the handler
//! registered under its `kind` first, then under its queue name.

use crate::error::{Result, TaskQueueError};
use crate::task::{HandlerError, Task};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a handler receives for one execution
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The claimed task (attempt already counted)
    pub task: Task,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task: Task, cancel: CancellationToken) -> Self {
        Self { task, cancel }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.task.payload
    }

    /// Decode the payload into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        Ok(serde_json::from_value(self.task.payload.clone())?)
    }

    /// Whether the worker asked this execution to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the worker asks this execution to stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Task handler
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt of a task; the output becomes the task result
    async fn handle(&self, ctx: TaskContext) -> std::result::Result<serde_json::Value, HandlerError>;
}

/// Adapter that turns an async closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<serde_json::Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> std::result::Result<serde_json::Value, HandlerError> {
        (self.f)(ctx).await
    }
}

/// Handlers by name
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under a queue name or task kind
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(TaskQueueError::ConfigError(
                "handler name must not be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&name) {
            return Err(TaskQueueError::ConfigError(format!(
                "handler '{}' is already registered",
                name
            )));
        }
        tracing::debug!(handler = %name, "Registered task handler");
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler::new(f)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Handler for `task`: by kind, then by queue
    pub fn resolve(&self, task: &Task) -> Option<Arc<dyn TaskHandler>> {
        task.kind
            .as_deref()
            .and_then(|kind| self.get(kind))
            .or_else(|| self.get(&task.queue))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{priorities, TaskId, TaskStatus};
    use std::time::Duration;

    fn task(queue: &str, kind: Option<&str>) -> Task {
        Task {
            id: TaskId::new(),
            queue: queue.to_string(),
            kind: kind.map(str::to_string),
            payload: serde_json::json!({"to": "a@example.com", "retries": 2}),
            priority: priorities::NORMAL,
            status: TaskStatus::Processing,
            created_at: chrono::Utc::now(),
            scheduled_at: None,
            visible_after: None,
            attempt: 1,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            failures: Vec::new(),
        }
    }

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, ctx: TaskContext) -> std::result::Result<serde_json::Value, HandlerError> {
            Ok(ctx.payload().clone())
        }
    }

    #[tokio::test]
    async fn test_resolve_prefers_kind() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("emails", |_ctx| async { Ok(serde_json::json!("queue")) })
            .unwrap();
        registry
            .register_fn("welcome", |_ctx| async { Ok(serde_json::json!("kind")) })
            .unwrap();

        let ctx = |t: Task| TaskContext::new(t, CancellationToken::new());

        let by_kind = task("emails", Some("welcome"));
        let out = registry.resolve(&by_kind).unwrap().handle(ctx(by_kind)).await.unwrap();
        assert_eq!(out, serde_json::json!("kind"));

        let unknown_kind = task("emails", Some("other"));
        let out = registry
            .resolve(&unknown_kind)
            .unwrap()
            .handle(ctx(unknown_kind))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!("queue"));

        assert!(registry.resolve(&task("reports", None)).is_none());
    }

    #[test]
    fn test_register_rejects_duplicates_and_empty_names() {
        let mut registry = HandlerRegistry::new();
        registry.register("emails", Arc::new(Echo)).unwrap();
        assert!(matches!(
            registry.register("emails", Arc::new(Echo)),
            Err(TaskQueueError::ConfigError(_))
        ));
        assert!(registry.register("", Arc::new(Echo)).is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["emails".to_string()]);
    }

    #[tokio::test]
    async fn test_context_decode_and_cancel() {
        #[derive(serde::Deserialize)]
        struct Email {
            to: String,
            retries: u32,
        }

        let token = CancellationToken::new();
        let ctx = TaskContext::new(task("emails", None), token.clone());
        let email: Email = ctx.decode().unwrap();
        assert_eq!(email.to, "a@example.com");
        assert_eq!(email.retries, 2);

        let bad: std::result::Result<Vec<u8>, HandlerError> = ctx.decode();
        assert!(bad.unwrap_err().message.starts_with("invalid payload"));

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_propagates_with_question_mark() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("strict", |ctx: TaskContext| async move {
                let n: u64 = ctx.decode()?;
                Ok::<_, HandlerError>(serde_json::json!(n * 2))
            })
            .unwrap();

        let handler = registry.get("strict").unwrap();
        let err = handler
            .handle(TaskContext::new(task("strict", None), CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(err.message.contains("invalid payload"));
    }
}
