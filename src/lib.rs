//! # Redis Task Queue
//!
//! A distributed task queue backed by Redis. Producers enqueue typed tasks,
//! workers in any number of processes claim them from weighted queues and run
//! them through registered handlers.
//!
//! ## Features
//!
//! - Weighted or strict priority across named queues
//! - Delayed tasks (`ProcessIn` / `ProcessAt`) and recurring submission
//! - Retries with exponential backoff and a bounded dead-letter set
//! - Per-task timeouts and deadlines
//! - Unique tasks, deduplicated on queue, type and payload
//! - Leases, so tasks held by a crashed worker are delivered again
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redis_task_queue::{
//!     RedisBroker, RedisBrokerConfig, ServeMux, Task, TaskClient, TaskOption, Worker, WorkerConfig,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let broker = Arc::new(RedisBroker::new(RedisBrokerConfig::default()).await?);
//!
//! let client = TaskClient::from_broker(broker.clone());
//! let task = Task::new("email:deliver", br#"{"user_id":42}"#.to_vec());
//! client
//!     .enqueue(&task, &[TaskOption::ProcessIn(Duration::from_secs(60))])
//!     .await?;
//!
//! let mut mux = ServeMux::new();
//! mux.handle_func("email:deliver", |_ctx, task| async move {
//!     println!("sending {}", String::from_utf8_lossy(task.payload()));
//!     Ok(())
//! });
//!
//! let config = WorkerConfig {
//!     concurrency: 10,
//!     queues: HashMap::from([("critical".into(), 6), ("default".into(), 3), ("low".into(), 1)]),
//!     ..WorkerConfig::default()
//! };
//! Worker::new(config, broker)?.run_until_signal(mux).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod logging;
pub mod periodic;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, MemoryBroker, QueueStats, RedisBroker, RedisBrokerConfig, RetentionConfig};
pub use client::TaskClient;
pub use dispatcher::PriorityDispatcher;
pub use error::{TaskError, TaskResult};
pub use handler::{handler_fn, Handler, ServeMux, TaskContext};
pub use periodic::{PeriodicScheduler, Schedule};
pub use retry::{FailureManager, RetryDecision, RetryPolicy};
pub use scheduler::{LeaseRecoverer, TaskScheduler};
pub use task::{EnqueueResult, LeaseToken, Task, TaskId, TaskInfo, TaskMessage, TaskOption, TaskState};
pub use worker::{Worker, WorkerConfig, WorkerStats};

/// Version of the task queue library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
