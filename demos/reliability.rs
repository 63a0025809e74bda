//! Reliability features example
//!
//! This example demonstrates:
//! - Retries with exponential backoff
//! - Handler timeouts
//! - Dead-lettering and requeueing
//! - Graceful shutdown

use a3s_taskq::{
    EnqueueOptions, HandlerError, QueueConfig, SchedulerConfig, ServiceConfig, TaskContext,
    TaskLookup, TaskQueueService, WorkerConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

async fn wait_for<F>(service: &TaskQueueService, id: &a3s_taskq::TaskId, done: F) -> anyhow::Result<TaskLookup>
where
    F: Fn(&TaskLookup) -> bool,
{
    loop {
        let lookup = service.get_task_status(id).await?;
        if done(&lookup) {
            return Ok(lookup);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== A3S TaskQ: Reliability Features Example ===\n");

    let config = ServiceConfig::default()
        .with_queue(
            QueueConfig::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(100), Duration::from_secs(2)),
        )
        .with_scheduler(SchedulerConfig::default().with_tick_interval(Duration::from_millis(50)))
        .with_workers(
            WorkerConfig::new(4)
                .with_handler_timeout(Duration::from_millis(300))
                .with_shutdown_grace(Duration::from_secs(2)),
        );

    let failures = Arc::new(AtomicU32::new(0));
    let counter = failures.clone();

    let service = TaskQueueService::builder(config)
        .with_handler_fn("flaky", move |ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                let attempt = ctx.task.attempt;
                println!("  [flaky] attempt {}", attempt);
                if attempt < 3 {
                    counter.fetch_add(1, Ordering::SeqCst);
                    return Err(HandlerError::new(format!("temporary failure on attempt {}", attempt)));
                }
                Ok(serde_json::json!({"attempts": attempt}))
            }
        })
        .with_handler_fn("slow", |_ctx: TaskContext| async {
            println!("  [slow] starting, will exceed the 300ms timeout");
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::json!("never"))
        })
        .build()
        .await?;
    service.start().await?;

    // 1. Retries
    println!("1. Retry with exponential backoff");
    let id = service
        .enqueue("flaky", serde_json::json!({}), EnqueueOptions::new())
        .await?;
    if let TaskLookup::Finished(result) =
        wait_for(&service, &id, |l| matches!(l, TaskLookup::Finished(_))).await?
    {
        println!(
            "  ✓ succeeded on attempt {} after {} failures\n",
            result.attempt_at_completion,
            failures.load(Ordering::SeqCst)
        );
    }

    // 2. Timeouts end in the dead-letter set once retries run out
    println!("2. Handler timeout and dead-lettering");
    let id = service
        .enqueue("slow", serde_json::json!({}), EnqueueOptions::new().with_max_attempts(2))
        .await?;
    wait_for(&service, &id, |l| matches!(l, TaskLookup::DeadLettered(_))).await?;
    for letter in service.dead_letters("slow", 0, 10).await? {
        println!("  ✗ dead letter {} after {} attempts", letter.task_id, letter.attempts);
        for failure in &letter.failures {
            println!("    attempt {}: {}", failure.attempt, failure.message);
        }
    }

    // 3. Requeue the dead letter, then purge it
    println!("\n3. Requeue from the dead-letter set");
    service.requeue_dead_letter(&id).await?;
    println!("  → requeued {}", id);
    wait_for(&service, &id, |l| matches!(l, TaskLookup::DeadLettered(_))).await?;
    let purged = service.purge_dead_letters("slow").await?;
    println!("  ✓ purged {} dead letter(s)", purged);

    println!("\n4. Graceful shutdown");
    service.stop().await;
    println!("  ✓ Shutdown complete");

    Ok(())
}
