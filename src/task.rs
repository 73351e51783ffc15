//! Task envelope, enqueue options and the stored task record

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

/// Unique identifier for tasks (UUID v7, ordered by creation time)
pub type TaskId = Uuid;

/// Identifies one claim of a task; a new token is issued on every dequeue
pub type LeaseToken = Uuid;

/// Queue used when no `Queue` option is given
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget used when no `MaxRetry` option is given
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Where a task currently lives in the store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Ready in its queue
    Pending,
    /// Waiting for its `process_at` time
    Scheduled,
    /// Waiting for its backoff delay after a failure
    Retry,
    /// Claimed by a worker under a lease
    Active,
    /// Dead-lettered
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Retry => "retry",
            TaskState::Active => "active",
            TaskState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "scheduled" => Some(TaskState::Scheduled),
            "retry" => Some(TaskState::Retry),
            "active" => Some(TaskState::Active),
            "dead" => Some(TaskState::Dead),
            _ => None,
        }
    }
}

/// A unit of work: a type string plus an opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
}

impl Task {
    /// Create a task from raw payload bytes
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(task_type: T, payload: P) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
        }
    }

    /// Create a task whose payload is the JSON encoding of `payload`
    pub fn from_json<T: Into<String>, P: Serialize>(task_type: T, payload: &P) -> TaskResult<Self> {
        Ok(Self::new(task_type, serde_json::to_vec(payload)?))
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON
    pub fn json<P: DeserializeOwned>(&self) -> TaskResult<P> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Options accepted by `TaskClient::enqueue`
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOption {
    /// Target queue name
    Queue(String),
    /// Maximum number of retries before the task is dead-lettered
    MaxRetry(u32),
    /// Per-attempt processing timeout
    Timeout(Duration),
    /// Absolute time after which the task is failed without retry
    Deadline(DateTime<Utc>),
    /// Process after the given delay
    ProcessIn(Duration),
    /// Process at the given time
    ProcessAt(DateTime<Utc>),
    /// Reject duplicates of this task (same queue, type and payload) for the TTL
    Unique(Duration),
    /// Use a caller-chosen id instead of a generated one
    TaskId(TaskId),
}

/// Options after defaults and per-call overrides are folded together
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub queue: String,
    pub max_retry: u32,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub process_at: Option<DateTime<Utc>>,
    pub unique_ttl: Option<Duration>,
    pub task_id: Option<TaskId>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            timeout: None,
            deadline: None,
            process_at: None,
            unique_ttl: None,
            task_id: None,
        }
    }
}

impl TaskOptions {
    /// Apply options in order; later options win
    pub fn resolve<'a, I>(options: I, now: DateTime<Utc>) -> TaskResult<Self>
    where
        I: IntoIterator<Item = &'a TaskOption>,
    {
        let mut resolved = Self::default();
        for option in options {
            match option {
                TaskOption::Queue(name) => {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(TaskError::enqueue("queue name must not be empty"));
                    }
                    resolved.queue = name.to_string();
                }
                TaskOption::MaxRetry(n) => resolved.max_retry = *n,
                TaskOption::Timeout(d) => {
                    if d.is_zero() {
                        return Err(TaskError::enqueue("timeout must be positive"));
                    }
                    resolved.timeout = Some(*d);
                }
                TaskOption::Deadline(at) => resolved.deadline = Some(*at),
                TaskOption::ProcessIn(d) => {
                    resolved.process_at = Some(offset(now, *d)?);
                }
                TaskOption::ProcessAt(at) => resolved.process_at = Some(*at),
                TaskOption::Unique(ttl) => {
                    if ttl.as_millis() == 0 {
                        return Err(TaskError::enqueue("unique TTL must be at least 1ms"));
                    }
                    resolved.unique_ttl = Some(*ttl);
                }
                TaskOption::TaskId(id) => resolved.task_id = Some(*id),
            }
        }
        Ok(resolved)
    }

    /// True when the task should go to the scheduled set instead of its queue
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.process_at, Some(at) if at > now)
    }
}

pub(crate) fn to_chrono(d: Duration) -> TaskResult<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|_| TaskError::enqueue("duration out of range"))
}

/// `at + d`, failing instead of overflowing the calendar
pub(crate) fn offset(at: DateTime<Utc>, d: Duration) -> TaskResult<DateTime<Utc>> {
    at.checked_add_signed(to_chrono(d)?)
        .ok_or_else(|| TaskError::enqueue("duration out of range"))
}

/// The record persisted for each task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    pub retry_count: u32,
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: Option<u64>,
    pub deadline: Option<DateTime<Utc>>,
    pub unique_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Claim held by the worker processing this copy; never persisted
    #[serde(skip)]
    pub lease: Option<LeaseToken>,
}

impl TaskMessage {
    /// Build the stored record for `task` under the resolved options
    pub fn new(task: &Task, options: &TaskOptions, now: DateTime<Utc>) -> Self {
        let unique_key = options
            .unique_ttl
            .map(|_| unique_key(&options.queue, task.task_type(), task.payload()));
        Self {
            id: options.task_id.unwrap_or_else(Uuid::now_v7),
            task_type: task.task_type().to_string(),
            payload: task.payload().to_vec(),
            queue: options.queue.clone(),
            max_retry: options.max_retry,
            retry_count: 0,
            timeout_ms: options.timeout.map(|d| d.as_millis() as u64),
            deadline: options.deadline,
            unique_key,
            created_at: now,
            last_error: None,
            last_failed_at: None,
            lease: None,
        }
    }

    /// The envelope handed to handlers
    pub fn task(&self) -> Task {
        Task::new(self.task_type.clone(), self.payload.clone())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    /// How long the next attempt may run: the task timeout (or the default),
    /// cut short by the deadline when that comes first.
    pub fn effective_timeout(&self, default: Option<Duration>, now: DateTime<Utc>) -> Option<Duration> {
        let timeout = self.timeout().or(default);
        let until_deadline = self
            .deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO));
        match (timeout, until_deadline) {
            (Some(t), Some(d)) => Some(t.min(d)),
            (t, d) => t.or(d),
        }
    }

    /// Record the error of a failed attempt
    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.last_error = Some(error.to_string());
        self.last_failed_at = Some(now);
    }

    pub fn to_json(&self) -> TaskResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> TaskResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Lock key shared by tasks with the same queue, type and payload
pub fn unique_key(queue: &str, task_type: &str, payload: &[u8]) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, payload);
    format!("{}:{}:{}", queue, task_type, digest.simple())
}

/// Returned by a successful enqueue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnqueueResult {
    pub id: TaskId,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
    /// When the task becomes visible to workers
    pub process_at: DateTime<Utc>,
    pub state: TaskState,
}

/// A task record together with its current state, for inspection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub message: TaskMessage,
    pub state: TaskState,
    /// Next time the task is due (scheduled and retry states only)
    pub next_process_at: Option<DateTime<Utc>>,
}
