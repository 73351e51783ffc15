//! In-process broker backed by a single locked arena
//!
//! Tasks are stored once, keyed by id; queues and sets only hold ids. Every
//! operation takes the arena lock for its whole duration, which gives the
//! same all-or-nothing behaviour the Redis scripts provide.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Broker, QueueStats, RetentionConfig};
use crate::error::{TaskError, TaskResult};
use crate::task::{offset, to_chrono, LeaseToken, TaskId, TaskInfo, TaskMessage, TaskState};

#[derive(Debug)]
struct Record {
    msg: TaskMessage,
    state: TaskState,
    /// Position in the scheduled set, while scheduled or retrying
    scheduled_at: Option<(DateTime<Utc>, u64)>,
}

#[derive(Debug, Default)]
struct Arena {
    tasks: HashMap<TaskId, Record>,
    /// Ready queues: insertion sequence -> task id
    queues: HashMap<String, BTreeMap<u64, TaskId>>,
    scheduled: BTreeSet<(DateTime<Utc>, u64, TaskId)>,
    /// In-progress tasks with the token of the current claim and its expiry
    active: HashMap<TaskId, (LeaseToken, DateTime<Utc>)>,
    dead: BTreeSet<(DateTime<Utc>, u64, TaskId)>,
    /// unique key -> (owner, lock expiry)
    unique: HashMap<String, (TaskId, DateTime<Utc>)>,
    seq: u64,
}

impl Arena {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn take_unique_lock(
        &mut self,
        msg: &TaskMessage,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> TaskResult<()> {
        let (Some(key), Some(ttl)) = (&msg.unique_key, ttl) else {
            return Ok(());
        };
        if let Some((_, expires_at)) = self.unique.get(key) {
            if *expires_at > now {
                return Err(TaskError::DuplicateTask {
                    unique_key: key.clone(),
                });
            }
        }
        self.unique.insert(key.clone(), (msg.id, offset(now, ttl)?));
        Ok(())
    }

    fn release_unique_lock(&mut self, msg: &TaskMessage) {
        if let Some(key) = &msg.unique_key {
            if matches!(self.unique.get(key), Some((owner, _)) if *owner == msg.id) {
                self.unique.remove(key);
            }
        }
    }

    fn check_new(&self, msg: &TaskMessage) -> TaskResult<()> {
        if self.tasks.contains_key(&msg.id) {
            return Err(TaskError::TaskIdConflict {
                task_id: msg.id.to_string(),
            });
        }
        Ok(())
    }

    fn push_ready(&mut self, id: TaskId, queue: &str) {
        let seq = self.next_seq();
        self.queues.entry(queue.to_string()).or_default().insert(seq, id);
    }

    fn push_scheduled(&mut self, id: TaskId, process_at: DateTime<Utc>) -> (DateTime<Utc>, u64) {
        let seq = self.next_seq();
        self.scheduled.insert((process_at, seq, id));
        (process_at, seq)
    }

    /// Take an in-progress task out of the active set, or fail unless `msg`
    /// carries the token of the current claim
    fn release_active(&mut self, msg: &TaskMessage) -> TaskResult<&mut Record> {
        let id = msg.id;
        match (self.active.get(&id), msg.lease) {
            (Some((held, _)), Some(token)) if *held == token => {
                self.active.remove(&id);
            }
            _ => return Err(TaskError::not_found(id)),
        }
        self.tasks.get_mut(&id).ok_or_else(|| TaskError::not_found(id))
    }

    fn trim_dead(&mut self, retention: &RetentionConfig, now: DateTime<Utc>) {
        let max_age = to_chrono(retention.dead_letter_max_age).unwrap_or_else(|_| chrono::Duration::days(90));
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        while let Some(first) = self.dead.first().copied() {
            let too_old = first.0 < cutoff;
            let too_many = self.dead.len() > retention.dead_letter_max_size;
            if !too_old && !too_many {
                break;
            }
            self.dead.remove(&first);
            self.tasks.remove(&first.2);
        }
    }
}

/// Broker keeping all state in process memory
#[derive(Debug, Default)]
pub struct MemoryBroker {
    arena: Mutex<Arena>,
    retention: RetentionConfig,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionConfig) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            retention,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, msg: &TaskMessage, unique_ttl: Option<Duration>) -> TaskResult<()> {
        let mut arena = self.arena.lock().await;
        arena.check_new(msg)?;
        arena.take_unique_lock(msg, unique_ttl, Utc::now())?;
        arena.push_ready(msg.id, &msg.queue);
        arena.tasks.insert(
            msg.id,
            Record {
                msg: msg.clone(),
                state: TaskState::Pending,
                scheduled_at: None,
            },
        );
        debug!("Enqueued task {} to queue {}", msg.id, msg.queue);
        Ok(())
    }

    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique_ttl: Option<Duration>,
    ) -> TaskResult<()> {
        let mut arena = self.arena.lock().await;
        arena.check_new(msg)?;
        arena.take_unique_lock(msg, unique_ttl, Utc::now())?;
        let position = arena.push_scheduled(msg.id, process_at);
        arena.tasks.insert(
            msg.id,
            Record {
                msg: msg.clone(),
                state: TaskState::Scheduled,
                scheduled_at: Some(position),
            },
        );
        debug!("Scheduled task {} for {}", msg.id, process_at);
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[String],
        lease_until: DateTime<Utc>,
    ) -> TaskResult<Option<TaskMessage>> {
        let mut arena = self.arena.lock().await;
        for name in queues {
            let Some(id) = arena
                .queues
                .get_mut(name)
                .and_then(|queue| queue.pop_first())
                .map(|(_, id)| id)
            else {
                continue;
            };
            let token = LeaseToken::now_v7();
            arena.active.insert(id, (token, lease_until));
            if let Some(record) = arena.tasks.get_mut(&id) {
                record.state = TaskState::Active;
                let mut claimed = record.msg.clone();
                claimed.lease = Some(token);
                return Ok(Some(claimed));
            }
            arena.active.remove(&id);
        }
        Ok(None)
    }

    async fn ack(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut arena = self.arena.lock().await;
        arena.release_active(msg)?;
        arena.tasks.remove(&msg.id);
        arena.release_unique_lock(msg);
        Ok(())
    }

    async fn retry(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> TaskResult<()> {
        let mut arena = self.arena.lock().await;
        arena.release_active(msg)?;
        let position = arena.push_scheduled(msg.id, process_at);
        if let Some(record) = arena.tasks.get_mut(&msg.id) {
            record.msg = TaskMessage {
                lease: None,
                ..msg.clone()
            };
            record.state = TaskState::Retry;
            record.scheduled_at = Some(position);
        }
        Ok(())
    }

    async fn fail(&self, msg: &TaskMessage) -> TaskResult<()> {
        let now = Utc::now();
        let mut arena = self.arena.lock().await;
        arena.release_active(msg)?;
        let seq = arena.next_seq();
        arena.dead.insert((now, seq, msg.id));
        if let Some(record) = arena.tasks.get_mut(&msg.id) {
            record.msg = TaskMessage {
                lease: None,
                ..msg.clone()
            };
            record.state = TaskState::Dead;
            record.scheduled_at = None;
        }
        arena.release_unique_lock(msg);
        arena.trim_dead(&self.retention, now);
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: TaskId,
        lease: LeaseToken,
        lease_until: DateTime<Utc>,
    ) -> TaskResult<bool> {
        let mut arena = self.arena.lock().await;
        match arena.active.get_mut(&id) {
            Some((held, expiry)) if *held == lease => {
                *expiry = lease_until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn forward_scheduled(&self, now: DateTime<Utc>) -> TaskResult<u64> {
        let mut arena = self.arena.lock().await;
        let mut forwarded = 0;
        while let Some(entry) = arena.scheduled.first().copied() {
            if entry.0 > now {
                break;
            }
            arena.scheduled.remove(&entry);
            let id = entry.2;
            let Some(queue) = arena.tasks.get(&id).map(|r| r.msg.queue.clone()) else {
                continue;
            };
            arena.push_ready(id, &queue);
            if let Some(record) = arena.tasks.get_mut(&id) {
                record.state = TaskState::Pending;
                record.scheduled_at = None;
            }
            forwarded += 1;
        }
        Ok(forwarded)
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> TaskResult<u64> {
        let mut arena = self.arena.lock().await;
        let mut expired: Vec<(DateTime<Utc>, TaskId)> = arena
            .active
            .iter()
            .filter(|(_, (_, expiry))| *expiry < now)
            .map(|(id, (_, expiry))| (*expiry, *id))
            .collect();
        expired.sort();

        for (_, id) in &expired {
            arena.active.remove(id);
            let Some(queue) = arena.tasks.get(id).map(|r| r.msg.queue.clone()) else {
                continue;
            };
            arena.push_ready(*id, &queue);
            if let Some(record) = arena.tasks.get_mut(id) {
                record.state = TaskState::Pending;
            }
        }
        Ok(expired.len() as u64)
    }

    async fn task_info(&self, id: TaskId) -> TaskResult<Option<TaskInfo>> {
        let arena = self.arena.lock().await;
        Ok(arena.tasks.get(&id).map(|record| TaskInfo {
            message: record.msg.clone(),
            state: record.state,
            next_process_at: record.scheduled_at.map(|(at, _)| at),
        }))
    }

    async fn dead_letters(&self, limit: usize) -> TaskResult<Vec<TaskMessage>> {
        let arena = self.arena.lock().await;
        Ok(arena
            .dead
            .iter()
            .rev()
            .take(limit)
            .filter_map(|(_, _, id)| arena.tasks.get(id).map(|r| r.msg.clone()))
            .collect())
    }

    async fn stats(&self) -> TaskResult<QueueStats> {
        let arena = self.arena.lock().await;
        Ok(QueueStats {
            pending: arena
                .queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.len() as u64))
                .collect(),
            scheduled: arena.scheduled.len() as u64,
            active: arena.active.len() as u64,
            dead: arena.dead.len() as u64,
        })
    }
}
