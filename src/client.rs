//! Client interface for submitting tasks to the queue

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::broker::{Broker, QueueStats, RedisBroker, RedisBrokerConfig};
use crate::error::{TaskError, TaskResult};
use crate::task::{
    EnqueueResult, Task, TaskId, TaskInfo, TaskMessage, TaskOption, TaskOptions, TaskState,
};

/// Client for submitting tasks to the distributed task queue
pub struct TaskClient {
    broker: Arc<dyn Broker>,
    /// Options applied to every task of a type, before call-site options
    defaults: RwLock<HashMap<String, Vec<TaskOption>>>,
}

impl TaskClient {
    /// Connect a client to Redis
    pub async fn new(config: RedisBrokerConfig) -> TaskResult<Self> {
        let broker = Arc::new(RedisBroker::new(config).await?);
        Ok(Self::from_broker(broker))
    }

    /// Create a task client on an existing broker
    pub fn from_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            defaults: RwLock::new(HashMap::new()),
        }
    }

    /// Set the options applied to every `task_type` task. Options passed to
    /// [`TaskClient::enqueue`] override them.
    pub async fn set_default_options(&self, task_type: impl Into<String>, options: Vec<TaskOption>) {
        self.defaults.write().await.insert(task_type.into(), options);
    }

    /// Submit a task.
    ///
    /// Tasks with a future `ProcessIn`/`ProcessAt` go to the scheduled set;
    /// everything else is ready immediately.
    pub async fn enqueue(&self, task: &Task, options: &[TaskOption]) -> TaskResult<EnqueueResult> {
        if task.task_type().trim().is_empty() {
            return Err(TaskError::enqueue("task type must not be empty"));
        }
        let now = Utc::now();
        let resolved = {
            let defaults = self.defaults.read().await;
            let type_defaults = defaults.get(task.task_type()).map(Vec::as_slice).unwrap_or(&[]);
            TaskOptions::resolve(type_defaults.iter().chain(options), now)?
        };
        if let Some(deadline) = resolved.deadline {
            if deadline <= now {
                return Err(TaskError::enqueue("deadline is already in the past"));
            }
        }

        let msg = TaskMessage::new(task, &resolved, now);
        let result = match resolved.process_at.filter(|_| resolved.is_delayed(now)) {
            Some(process_at) => {
                self.broker
                    .schedule(&msg, process_at, resolved.unique_ttl)
                    .await
                    .map_err(enqueue_error)?;
                EnqueueResult {
                    id: msg.id,
                    queue: msg.queue.clone(),
                    enqueued_at: now,
                    process_at,
                    state: TaskState::Scheduled,
                }
            }
            None => {
                self.broker
                    .enqueue(&msg, resolved.unique_ttl)
                    .await
                    .map_err(enqueue_error)?;
                EnqueueResult {
                    id: msg.id,
                    queue: msg.queue.clone(),
                    enqueued_at: now,
                    process_at: now,
                    state: TaskState::Pending,
                }
            }
        };

        debug!(
            "Enqueued task {} ({}) to queue {} for {}",
            result.id,
            task.task_type(),
            result.queue,
            result.process_at
        );
        Ok(result)
    }

    /// Submit several tasks with the same options, stopping at the first error
    pub async fn enqueue_batch(&self, tasks: &[Task], options: &[TaskOption]) -> TaskResult<Vec<EnqueueResult>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.enqueue(task, options).await?);
        }
        info!("Enqueued batch of {} tasks", results.len());
        Ok(results)
    }

    /// Get a task record and its state by id
    pub async fn task_info(&self, task_id: TaskId) -> TaskResult<Option<TaskInfo>> {
        self.broker.task_info(task_id).await
    }

    /// Dead-lettered tasks, most recent first, with their last error
    pub async fn dead_letters(&self, limit: usize) -> TaskResult<Vec<TaskMessage>> {
        self.broker.dead_letters(limit).await
    }

    /// Get queue statistics
    pub async fn queue_stats(&self) -> TaskResult<QueueStats> {
        self.broker.stats().await
    }

    /// Get access to the underlying broker for advanced operations
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

/// Store failures during submission surface as `EnqueueError`; duplicates and
/// validation errors keep their own kind
fn enqueue_error(err: TaskError) -> TaskError {
    match err {
        TaskError::DuplicateTask { .. } | TaskError::TaskIdConflict { .. } | TaskError::Enqueue { .. } => {
            err
        }
        other => TaskError::enqueue(other.to_string()),
    }
}
