//! Broker abstraction over the shared task store
//!
//! Every task state transition goes through a [`Broker`]. Implementations
//! must make each operation atomic with respect to concurrent callers: two
//! workers calling [`Broker::dequeue`] at the same time never receive the same
//! task.
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisBroker`]: Lua-scripted operations against a Redis-compatible store
//! - [`MemoryBroker`]: an in-process arena, for tests and single-process use

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::TaskResult;
use crate::task::{LeaseToken, TaskId, TaskInfo, TaskMessage};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerConfig};

/// How long dead-lettered tasks are kept around for inspection
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Dead-letter entries beyond this count are dropped, oldest first
    pub dead_letter_max_size: usize,
    /// Dead-letter entries older than this are dropped
    pub dead_letter_max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            dead_letter_max_size: 10_000,
            dead_letter_max_age: Duration::from_secs(90 * 24 * 3600), // 90 days
        }
    }
}

/// Point-in-time counts across the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready tasks per queue
    pub pending: BTreeMap<String, u64>,
    /// Tasks waiting for their process time (delayed and retrying)
    pub scheduled: u64,
    /// Tasks claimed by workers
    pub active: u64,
    /// Dead-lettered tasks
    pub dead: u64,
}

impl QueueStats {
    pub fn pending_total(&self) -> u64 {
        self.pending.values().sum()
    }
}

/// Atomic task state transitions against the shared store
#[async_trait]
pub trait Broker: Send + Sync {
    /// Add a task to the tail of its queue.
    ///
    /// With `unique_ttl` set, fails with `DuplicateTask` while another task
    /// holds the lock on `msg.unique_key`.
    async fn enqueue(&self, msg: &TaskMessage, unique_ttl: Option<Duration>) -> TaskResult<()>;

    /// Add a task to the scheduled set, invisible to workers until `process_at`
    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique_ttl: Option<Duration>,
    ) -> TaskResult<()>;

    /// Claim the head of the first non-empty queue in `queues`, in order.
    ///
    /// The claimed task moves to the in-progress set with a lease ending at
    /// `lease_until`. The returned message carries a fresh lease token that
    /// the later transitions must present. Returns `None` immediately when
    /// every queue is empty.
    async fn dequeue(
        &self,
        queues: &[String],
        lease_until: DateTime<Utc>,
    ) -> TaskResult<Option<TaskMessage>>;

    /// Remove a successfully processed task.
    ///
    /// `ack`, `retry` and `fail` answer `TaskNotFound` unless `msg.lease` is
    /// the token of the task's current claim.
    async fn ack(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Release a failed task back to the scheduled set, due at `process_at`.
    /// `msg` carries the updated retry count and last error.
    async fn retry(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> TaskResult<()>;

    /// Move a task to the dead-letter set
    async fn fail(&self, msg: &TaskMessage) -> TaskResult<()>;

    /// Push the lease of an in-progress task out to `lease_until`.
    /// Returns false when the task is no longer held under `lease`.
    async fn extend_lease(
        &self,
        id: TaskId,
        lease: LeaseToken,
        lease_until: DateTime<Utc>,
    ) -> TaskResult<bool>;

    /// Move every scheduled task due at `now` into its queue
    async fn forward_scheduled(&self, now: DateTime<Utc>) -> TaskResult<u64>;

    /// Return every in-progress task whose lease expired before `now` to its queue
    async fn recover_expired(&self, now: DateTime<Utc>) -> TaskResult<u64>;

    /// Look up a task record and its state
    async fn task_info(&self, id: TaskId) -> TaskResult<Option<TaskInfo>>;

    /// Most recently dead-lettered tasks first
    async fn dead_letters(&self, limit: usize) -> TaskResult<Vec<TaskMessage>>;

    async fn stats(&self) -> TaskResult<QueueStats>;
}
