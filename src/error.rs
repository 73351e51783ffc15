//! Error types for the task queue

use thiserror::Error;

/// Result type alias for task queue operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error taxonomy for brokers, clients and the worker pool
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis protocol or command errors that are not connectivity related
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Task record serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The task could not be enqueued (validation failure or store rejection)
    #[error("Enqueue failed: {reason}")]
    Enqueue { reason: String },

    /// A task with the caller-chosen id is already in the store
    #[error("Task id {task_id} already exists")]
    TaskIdConflict { task_id: String },

    /// A unique lock is already held for this key
    #[error("Duplicate task: unique key {unique_key} is locked")]
    DuplicateTask { unique_key: String },

    /// No handler is registered for the task type
    #[error("No handler registered for task type: {task_type}")]
    NoHandler { task_type: String },

    /// The handler returned an error
    #[error("Handler failed: {message}")]
    Handler { message: String },

    /// The handler did not finish within the task timeout
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },

    /// The absolute deadline of the task has passed
    #[error("Deadline exceeded for task {task_id}")]
    DeadlineExceeded { task_id: String },

    /// The handler asked for the task not to be retried
    #[error("Retry skipped: {message}")]
    SkipRetry { message: String },

    /// Store connectivity lost
    #[error("Broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    /// Task not found in the store (or no longer owned by the caller)
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Create an enqueue error
    pub fn enqueue<S: Into<String>>(reason: S) -> Self {
        Self::Enqueue {
            reason: reason.into(),
        }
    }

    /// Create a handler error
    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an error that dead-letters the task without further retries.
    ///
    /// Handlers return this (wrapped in `anyhow::Error`) when a failure is
    /// known to be permanent, e.g. a malformed payload.
    pub fn skip_retry<S: Into<String>>(message: S) -> Self {
        Self::SkipRetry {
            message: message.into(),
        }
    }

    /// Create a broker connectivity error
    pub fn broker_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::BrokerUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a task-not-found error
    pub fn not_found<S: ToString>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.to_string(),
        }
    }

    /// Failures that must never be retried, whatever the retry budget says
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TaskError::NoHandler { .. }
                | TaskError::DeadlineExceeded { .. }
                | TaskError::SkipRetry { .. }
        )
    }

    /// Check if the error is recoverable (can be retried)
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Redis(_) => true,
            TaskError::Handler { .. } => true,
            TaskError::Timeout { .. } => true,
            TaskError::BrokerUnavailable { .. } => true,
            TaskError::Io(_) => true,
            TaskError::Internal(_) => true,
            TaskError::Serialization(_) => false,
            TaskError::Enqueue { .. } => false,
            TaskError::DuplicateTask { .. } => false,
            TaskError::TaskIdConflict { .. } => false,
            TaskError::NoHandler { .. } => false,
            TaskError::DeadlineExceeded { .. } => false,
            TaskError::SkipRetry { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::Config { .. } => false,
        }
    }

    /// Classify a Redis error: connectivity problems become `BrokerUnavailable`
    pub(crate) fn from_redis(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::broker_unavailable(err.to_string())
        } else {
            Self::Redis(err)
        }
    }
}
