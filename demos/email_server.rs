//! Email and image worker
//!
//! This demo shows how to:
//! 1. Register a function handler and a struct handler on a `ServeMux`
//! 2. Enqueue immediate, delayed and unique tasks
//! 3. Serve three weighted queues until Ctrl-C
//!
//! To run it:
//! 1. Make sure Redis is running (override with `REDIS_URL`)
//! 2. Run: cargo run --example email_server

use async_trait::async_trait;
use redis_task_queue::logging::init_tracing;
use redis_task_queue::{
    Handler, RedisBroker, RedisBrokerConfig, ServeMux, Task, TaskClient, TaskContext, TaskError,
    TaskOption, Worker, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const TYPE_EMAIL_DELIVERY: &str = "email:deliver";
const TYPE_IMAGE_RESIZE: &str = "image:resize";

#[derive(Debug, Serialize, Deserialize)]
struct EmailDeliveryPayload {
    user_id: u64,
    template_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageResizePayload {
    source_url: String,
}

async fn handle_email_delivery(ctx: TaskContext, task: Task) -> anyhow::Result<()> {
    let payload: EmailDeliveryPayload = task
        .json()
        .map_err(|e| TaskError::skip_retry(format!("malformed payload: {}", e)))?;
    info!(
        "Sending email to user {} with template {} (attempt {})",
        payload.user_id,
        payload.template_id,
        ctx.retry_count + 1
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

/// Struct handler; stops early when the attempt is cancelled
struct ImageProcessor {
    max_dimension: u32,
}

#[async_trait]
impl Handler for ImageProcessor {
    async fn process_task(&self, ctx: TaskContext, task: Task) -> anyhow::Result<()> {
        let payload: ImageResizePayload = task
            .json()
            .map_err(|e| TaskError::skip_retry(format!("malformed payload: {}", e)))?;
        info!("Resizing {} to at most {}px", payload.source_url, self.max_dimension);
        tokio::select! {
            _ = ctx.cancelled() => anyhow::bail!("resize of {} cancelled", payload.source_url),
            _ = tokio::time::sleep(Duration::from_millis(300)) => Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let broker = Arc::new(RedisBroker::new(RedisBrokerConfig::from_env()).await?);
    let client = TaskClient::from_broker(broker.clone());
    client
        .set_default_options(
            TYPE_IMAGE_RESIZE,
            vec![TaskOption::MaxRetry(10), TaskOption::Timeout(Duration::from_secs(180))],
        )
        .await;

    info!("Submitting demo tasks...");
    let welcome = Task::from_json(
        TYPE_EMAIL_DELIVERY,
        &EmailDeliveryPayload {
            user_id: 42,
            template_id: "welcome".to_string(),
        },
    )?;
    let result = client.enqueue(&welcome, &[]).await?;
    info!("Enqueued {} to {}", result.id, result.queue);

    let reminder = Task::from_json(
        TYPE_EMAIL_DELIVERY,
        &EmailDeliveryPayload {
            user_id: 42,
            template_id: "reminder".to_string(),
        },
    )?;
    let result = client
        .enqueue(
            &reminder,
            &[
                TaskOption::ProcessIn(Duration::from_secs(10)),
                TaskOption::Unique(Duration::from_secs(3600)),
            ],
        )
        .await;
    match result {
        Ok(result) => info!("Scheduled {} for {}", result.id, result.process_at),
        Err(TaskError::DuplicateTask { unique_key }) => info!("Reminder already queued ({})", unique_key),
        Err(e) => return Err(e.into()),
    }

    for i in 0..3 {
        let resize = Task::from_json(
            TYPE_IMAGE_RESIZE,
            &ImageResizePayload {
                source_url: format!("https://example.com/images/{}.png", i),
            },
        )?;
        client
            .enqueue(&resize, &[TaskOption::Queue("critical".to_string())])
            .await?;
    }

    let mut mux = ServeMux::new();
    mux.handle_func(TYPE_EMAIL_DELIVERY, handle_email_delivery)
        .handle(TYPE_IMAGE_RESIZE, ImageProcessor { max_dimension: 1024 });

    let config = WorkerConfig {
        concurrency: 10,
        queues: HashMap::from([
            ("critical".to_string(), 6),
            ("default".to_string(), 3),
            ("low".to_string(), 1),
        ]),
        ..WorkerConfig::default()
    };
    let worker = Worker::new(config, broker)?;

    info!("Starting worker {}, press Ctrl-C to stop", worker.id());
    worker.run_until_signal(mux).await?;

    let stats = worker.get_stats().await;
    info!(
        "Processed {} tasks ({} ok, {} failed)",
        stats.tasks_processed, stats.tasks_successful, stats.tasks_failed
    );
    Ok(())
}
