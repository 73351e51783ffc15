//! Task handlers and the type-based router

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;
use crate::task::{Task, TaskId, TaskMessage};

/// Per-attempt information handed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub queue: String,
    pub retry_count: u32,
    pub max_retry: u32,
    /// When the current attempt must finish, from the task timeout or deadline
    pub deadline: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(msg: &TaskMessage, deadline: Option<DateTime<Utc>>, cancel: CancellationToken) -> Self {
        Self {
            task_id: msg.id,
            queue: msg.queue.clone(),
            retry_count: msg.retry_count,
            max_retry: msg.max_retry,
            deadline,
            cancel,
        }
    }

    /// True once the attempt timed out, lost its lease or the worker is
    /// force-stopping
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the attempt is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Processes one task; `Ok(())` acks it, an error sends it to the retry path.
///
/// Return a [`TaskError::SkipRetry`] to dead-letter the task without retries.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process_task(&self, ctx: TaskContext, task: Task) -> anyhow::Result<()>;
}

/// Adapter turning an async function into a [`Handler`]
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process_task(&self, ctx: TaskContext, task: Task) -> anyhow::Result<()> {
        (self.f)(ctx, task).await
    }
}

/// Shorthand for [`HandlerFn::new`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn::new(f)
}

/// Routes tasks to the handler registered for their type
#[derive(Default, Clone)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`. A later registration for the same
    /// type replaces the earlier one.
    pub fn handle<H>(&mut self, task_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        let task_type = task_type.into();
        if self.handlers.insert(task_type.clone(), Arc::new(handler)).is_some() {
            debug!("Replaced handler for task type {}", task_type);
        }
        self
    }

    /// Register an async function for `task_type`
    pub fn handle_func<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handle(task_type, HandlerFn::new(f))
    }

    pub fn handler(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn process_task(&self, ctx: TaskContext, task: Task) -> anyhow::Result<()> {
        match self.handler(task.task_type()) {
            Some(handler) => handler.process_task(ctx, task).await,
            None => Err(TaskError::NoHandler {
                task_type: task.task_type().to_string(),
            }
            .into()),
        }
    }
}
