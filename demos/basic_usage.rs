//! Basic usage example
//!
//! This example demonstrates the basic usage of a3s-taskq:
//! - Building a queue service with a handler
//! - Enqueueing tasks with priorities and a delay
//! - Looking up task status and results

use a3s_taskq::{
    priorities, EnqueueOptions, HandlerError, SchedulerConfig, ServiceConfig, TaskContext,
    TaskHandler, TaskLookup, TaskQueueService, WorkerConfig,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A handler that greets the name in its payload
struct GreetHandler;

#[derive(serde::Deserialize)]
struct Greet {
    name: String,
}

#[async_trait]
impl TaskHandler for GreetHandler {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, HandlerError> {
        let greet: Greet = ctx.decode()?;

        // Simulate some work
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(serde_json::json!({
            "greeting": format!("Hello, {}!", greet.name),
            "attempt": ctx.task.attempt,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== A3S TaskQ: Basic Usage Example ===\n");

    let config = ServiceConfig::default()
        .with_scheduler(SchedulerConfig::default().with_tick_interval(Duration::from_millis(100)))
        .with_workers(WorkerConfig::new(2));

    let service = TaskQueueService::builder(config)
        .with_handler("greetings", Arc::new(GreetHandler))
        .build()
        .await?;
    println!("✓ Queue service created (memory backend)");

    service.start().await?;
    println!("✓ Workers and scheduler started\n");

    println!("Enqueueing tasks...");
    let mut ids = Vec::new();
    for (name, priority) in [
        ("Alice", priorities::LOW),
        ("Bob", priorities::NORMAL),
        ("Charlie", priorities::HIGH),
    ] {
        let id = service
            .enqueue(
                "greetings",
                serde_json::json!({"name": name}),
                EnqueueOptions::new().with_priority(priority),
            )
            .await?;
        println!("  → {} (priority {}): {}", name, priority, id);
        ids.push((name, id));
    }

    let later = service
        .enqueue(
            "greetings",
            serde_json::json!({"name": "Dana"}),
            EnqueueOptions::new().with_delay(Duration::from_millis(500)),
        )
        .await?;
    println!("  → Dana (delayed 500ms): {}", later);
    ids.push(("Dana", later));

    println!("\nWaiting for results...\n");
    for (name, id) in ids {
        loop {
            match service.get_task_status(&id).await? {
                TaskLookup::Finished(result) => {
                    println!("✓ Result for {}: {:?}", name, result.output);
                    break;
                }
                TaskLookup::NotFound => {
                    eprintln!("✗ Task for {} disappeared", name);
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    println!("\n=== Health ===");
    let health = service.health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);

    println!("\n=== Shutting Down ===");
    service.stop().await;
    println!("✓ Shutdown complete");

    Ok(())
}
