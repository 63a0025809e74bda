//! Observability features example
//!
//! This example demonstrates:
//! - Metrics collection with latency histograms
//! - Lifecycle events on a broadcast stream
//! - Health and metrics reports
//! - OpenTelemetry recorder setup

use a3s_taskq::{
    events, metric_names, EnqueueOptions, HandlerError, QueueMetrics, SchedulerConfig,
    ServiceConfig, TaskContext, TaskQueueService, TaskStatus, WorkerConfig,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,a3s_taskq=debug")),
        )
        .init();

    println!("=== A3S TaskQ: Observability Features Example ===\n");

    // No-op unless a meter provider is installed globally
    a3s_taskq::telemetry::init_taskq_metrics();

    let metrics = QueueMetrics::local();
    let config = ServiceConfig::default()
        .with_scheduler(SchedulerConfig::default().with_tick_interval(Duration::from_millis(100)))
        .with_workers(WorkerConfig::new(4));

    let service = TaskQueueService::builder(config)
        .with_metrics(metrics.clone())
        .with_handler_fn("api", |ctx: TaskContext| async move {
            let duration_ms = ctx.payload()["duration_ms"].as_u64().unwrap_or(10);
            if duration_ms > 500 {
                return Err(HandlerError::new("request too slow")
                    .with_detail(serde_json::json!({"duration_ms": duration_ms})));
            }
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
            Ok(serde_json::json!({"duration_ms": duration_ms}))
        })
        .build()
        .await?;

    // Print every failure event as it happens
    let mut failures = service.subscribe_queue("api");
    let watcher = tokio::spawn(async move {
        while let Some(event) = failures.recv().await {
            if event.key == events::TASK_FAILED || event.key == events::TASK_RETRY_SCHEDULED {
                println!("  🚨 {} task={:?}", event.key, event.field("task_id"));
            }
        }
    });

    service.start().await?;
    println!("✓ Queue service started with metrics\n");

    // Example 1: Collect metrics
    println!("=== Example 1: Metrics Collection ===");

    let latencies = [50, 100, 150, 200, 250, 300, 400, 600];
    let mut ids = Vec::new();
    for latency in latencies {
        let id = service
            .enqueue(
                "api",
                serde_json::json!({"duration_ms": latency}),
                EnqueueOptions::new().with_max_attempts(1),
            )
            .await?;
        ids.push(id);
    }
    println!("Enqueued {} tasks", latencies.len());

    for id in &ids {
        loop {
            match service.get_task_status(id).await?.status() {
                Some(TaskStatus::Completed | TaskStatus::Failed | TaskStatus::DeadLettered) => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }
    println!();

    println!("=== Metrics Summary ===");
    let snapshot = metrics.snapshot().await;

    if let Some(enqueued) = snapshot.counters.get(metric_names::TASKS_ENQUEUED) {
        println!("Tasks enqueued: {}", enqueued);
    }
    if let Some(completed) = snapshot.counters.get(metric_names::TASKS_COMPLETED) {
        println!("Tasks completed: {}", completed);
    }
    if let Some(dead) = snapshot.counters.get(metric_names::TASKS_DEAD_LETTERED) {
        println!("Tasks dead-lettered: {}", dead);
    }

    if let Some(stats) = snapshot.histograms.get(metric_names::TASK_LATENCY) {
        println!("\nLatency Statistics:");
        println!("  Count: {}", stats.count);
        println!("  Min: {:.2}ms", stats.min);
        println!("  Max: {:.2}ms", stats.max);
        println!("  Mean: {:.2}ms", stats.mean);
        println!("  p50: {:.2}ms", stats.percentiles.p50);
        println!("  p90: {:.2}ms", stats.percentiles.p90);
        println!("  p95: {:.2}ms", stats.percentiles.p95);
        println!("  p99: {:.2}ms", stats.percentiles.p99);
    }
    println!();

    // Example 2: Service reports
    println!("=== Example 2: Health and Metrics Reports ===");
    let health = service.health().await;
    println!(
        "healthy={} promoter_alive={} workers={}/{} dead_letters={}",
        health.healthy,
        health.promoter_alive,
        health.workers.busy,
        health.workers.total,
        health.dead_letter_total
    );
    if let Some(report) = service.metrics().await {
        println!(
            "uptime={:.1}s enqueue_rate={:.2}/s dead_letter_rate={:.2}/s",
            report.uptime_secs, report.enqueue_rate, report.dead_letter_rate
        );
        if let Some(wait) = report.wait_time_ms {
            println!("wait time p95: {:.2}ms", wait.percentiles.p95);
        }
    }
    println!();

    // Example 3: Per-queue metrics
    println!("=== Example 3: Per-Queue Metrics ===");
    let per_queue = format!("{}.api", metric_names::TASKS_ENQUEUED);
    if let Some(enqueued) = snapshot.counters.get(&per_queue) {
        println!("api queue - Tasks enqueued: {}", enqueued);
    }
    let per_queue = format!("{}.api", metric_names::TASK_LATENCY);
    if let Some(stats) = snapshot.histograms.get(&per_queue) {
        println!("api queue - Mean latency: {:.2}ms", stats.mean);
    }
    println!();

    println!("=== Shutting Down ===");
    service.stop().await;
    watcher.abort();
    println!("✓ Shutdown complete");

    Ok(())
}
