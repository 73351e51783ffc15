//! Broker implementation on Redis
//!
//! Layout, with `{p}` the configured key prefix:
//!
//! - `{p}:queue:{name}`: sorted set of ready task ids, scored by `{p}:seq`
//! - `{p}:scheduled`: sorted set of delayed and retrying tasks as `{seq}:{id}`
//!   members, scored by due time (ms); the zero-padded seq orders ties
//! - `{p}:active`: sorted set of claimed ids, scored by lease expiry (ms)
//! - `{p}:dead`: sorted set of dead-lettered ids, scored by time of death (ms)
//! - `{p}:task:{id}`: hash with the `msg` record, `state`, `queue`, `process_at`
//!   and, while claimed, the `lease` token
//! - `{p}:unique:{key}`: unique lock holding the owner id, with a TTL
//! - `{p}:queues`: set of known queue names
//!
//! Each state transition is a single Lua script, so it runs atomically.

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisResult, Script};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{Broker, QueueStats, RetentionConfig};
use crate::error::{TaskError, TaskResult};
use crate::task::{LeaseToken, TaskId, TaskInfo, TaskMessage, TaskState};

const ENQUEUE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  if not redis.call("SET", KEYS[4], ARGV[2], "NX", "PX", ARGV[4]) then
    return -1
  end
end
local seq = redis.call("INCR", KEYS[5])
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "pending", "queue", ARGV[3])
redis.call("ZADD", KEYS[2], seq, ARGV[2])
redis.call("SADD", KEYS[3], ARGV[3])
return 1
"#;

const SCHEDULE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  if not redis.call("SET", KEYS[4], ARGV[2], "NX", "PX", ARGV[4]) then
    return -1
  end
end
local seq = redis.call("INCR", KEYS[5])
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "scheduled", "queue", ARGV[3], "process_at", ARGV[5])
redis.call("ZADD", KEYS[2], ARGV[5], string.format("%020d:%s", seq, ARGV[2]))
redis.call("SADD", KEYS[3], ARGV[3])
return 1
"#;

// KEYS[1] is the active set, KEYS[2..] the queues in poll order.
const DEQUEUE_SCRIPT: &str = r#"
for i = 2, #KEYS do
  local ids = redis.call("ZRANGE", KEYS[i], 0, 0)
  if #ids > 0 then
    local id = ids[1]
    redis.call("ZREM", KEYS[i], id)
    local key = ARGV[2] .. id
    local msg = redis.call("HGET", key, "msg")
    if msg then
      redis.call("ZADD", KEYS[1], ARGV[1], id)
      redis.call("HSET", key, "state", "active", "lease", ARGV[3])
      return msg
    end
  end
end
return nil
"#;

// The transitions out of the active set only act for the current claim:
// the task hash must still hold the caller's lease token (last ARGV).
const ACK_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[2], "lease") ~= ARGV[2] or not redis.call("ZSCORE", KEYS[1], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("DEL", KEYS[2])
if redis.call("GET", KEYS[3]) == ARGV[1] then
  redis.call("DEL", KEYS[3])
end
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[2], "lease") ~= ARGV[4] or not redis.call("ZSCORE", KEYS[1], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[1], ARGV[1])
local seq = redis.call("INCR", KEYS[4])
redis.call("HSET", KEYS[2], "msg", ARGV[2], "state", "retry", "process_at", ARGV[3])
redis.call("HDEL", KEYS[2], "lease")
redis.call("ZADD", KEYS[3], ARGV[3], string.format("%020d:%s", seq, ARGV[1]))
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[2], "lease") ~= ARGV[7] or not redis.call("ZSCORE", KEYS[1], ARGV[1]) then
  return 0
end
redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("HSET", KEYS[2], "msg", ARGV[2], "state", "dead")
redis.call("HDEL", KEYS[2], "process_at", "lease")
redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1])
if redis.call("GET", KEYS[4]) == ARGV[1] then
  redis.call("DEL", KEYS[4])
end
local expired = redis.call("ZRANGEBYSCORE", KEYS[3], "-inf", "(" .. ARGV[4])
local over = redis.call("ZCARD", KEYS[3]) - tonumber(ARGV[5])
if over > 0 then
  for _, id in ipairs(redis.call("ZRANGE", KEYS[3], 0, over - 1)) do
    table.insert(expired, id)
  end
end
for _, id in ipairs(expired) do
  redis.call("ZREM", KEYS[3], id)
  redis.call("DEL", ARGV[6] .. id)
end
return 1
"#;

const EXTEND_LEASE_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[2], "lease") == ARGV[3] and redis.call("ZSCORE", KEYS[1], ARGV[1]) then
  redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

// Moves up to ARGV[4] members scored <= ARGV[1] from KEYS[1] to their queues.
// Shared by the scheduler (scheduled set, `seq:id` members) and the recoverer
// (active set, bare ids). Any claim on a moved task is dropped.
const FORWARD_SCRIPT: &str = r#"
local members = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[4]))
for _, member in ipairs(members) do
  redis.call("ZREM", KEYS[1], member)
  local id = string.match(member, "^%d+:(.+)$") or member
  local key = ARGV[2] .. id
  local queue = redis.call("HGET", key, "queue")
  if queue then
    local seq = redis.call("INCR", KEYS[2])
    redis.call("ZADD", ARGV[3] .. queue, seq, id)
    redis.call("HSET", key, "state", "pending")
    redis.call("HDEL", key, "process_at", "lease")
  end
end
return #members
"#;

/// Configuration for the Redis broker
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix for every key the broker touches
    pub key_prefix: String,
    /// Attempts at an operation while the store is unreachable
    pub max_reconnect_attempts: u32,
    /// First backoff between reconnect attempts, doubled each attempt
    pub reconnect_backoff: Duration,
    /// Maximum number of tasks moved per script call by the scheduler and recoverer
    pub batch_size: usize,
    pub retention: RetentionConfig,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "rtq".to_string(),
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(100),
            batch_size: 100,
            retention: RetentionConfig::default(),
        }
    }
}

impl RedisBrokerConfig {
    /// Defaults, overridden by `REDIS_URL` and `RTQ_KEY_PREFIX` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(prefix) = std::env::var("RTQ_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        config
    }

    fn validate(&self) -> TaskResult<()> {
        if self.batch_size == 0 {
            return Err(TaskError::config("batch_size must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn queue(&self, name: &str) -> String {
        format!("{}:queue:{}", self.prefix, name)
    }

    fn queue_prefix(&self) -> String {
        format!("{}:queue:", self.prefix)
    }

    fn task(&self, id: TaskId) -> String {
        format!("{}:task:{}", self.prefix, id)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.prefix)
    }

    fn unique(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("{}:unique:{}", self.prefix, key),
            None => format!("{}:unique:", self.prefix),
        }
    }

    fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    fn active(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn dead(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn seq(&self) -> String {
        format!("{}:seq", self.prefix)
    }
}

struct Scripts {
    enqueue: Script,
    schedule: Script,
    dequeue: Script,
    ack: Script,
    retry: Script,
    fail: Script,
    extend_lease: Script,
    forward: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            schedule: Script::new(SCHEDULE_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            extend_lease: Script::new(EXTEND_LEASE_SCRIPT),
            forward: Script::new(FORWARD_SCRIPT),
        }
    }
}

/// Broker storing tasks in Redis
pub struct RedisBroker {
    conn: ConnectionManager,
    config: RedisBrokerConfig,
    keys: Keys,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("redis_url", &self.config.redis_url)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Token of the claim `msg` was delivered under
fn claim(msg: &TaskMessage) -> TaskResult<String> {
    msg.lease
        .map(|lease| lease.to_string())
        .ok_or_else(|| TaskError::not_found(msg.id))
}

impl RedisBroker {
    /// Connect to Redis and verify the connection
    pub async fn new(config: RedisBrokerConfig) -> TaskResult<Self> {
        config.validate()?;
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| TaskError::config(format!("invalid redis url: {}", e)))?;

        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(TaskError::from_redis)?;

        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(TaskError::from_redis)?;

        info!("Connected to Redis at {}", config.redis_url);

        Ok(Self {
            conn,
            keys: Keys {
                prefix: config.key_prefix.clone(),
            },
            config,
            scripts: Scripts::load(),
        })
    }

    /// Connect with default configuration
    pub async fn new_default() -> TaskResult<Self> {
        Self::new(RedisBrokerConfig::default()).await
    }

    /// Run a store operation, retrying with backoff while the store is unreachable
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, f: F) -> TaskResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f(self.conn.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => match TaskError::from_redis(e) {
                    TaskError::BrokerUnavailable { reason }
                        if attempt < self.config.max_reconnect_attempts =>
                    {
                        let delay = self.config.reconnect_backoff * 2u32.saturating_pow(attempt);
                        warn!(
                            "Redis unavailable during {} (attempt {}): {}; retrying in {:?}",
                            operation,
                            attempt + 1,
                            reason,
                            delay
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    err => return Err(err),
                },
            }
        }
    }

    async fn insert(
        &self,
        operation: &'static str,
        msg: &TaskMessage,
        process_at: Option<DateTime<Utc>>,
        unique_ttl: Option<Duration>,
    ) -> TaskResult<()> {
        let json = msg.to_json()?;
        let id = msg.id.to_string();
        let unique_key = self.keys.unique(msg.unique_key.as_deref());
        let ttl = if msg.unique_key.is_some() {
            ttl_millis(unique_ttl)
        } else {
            0
        };

        let mut invocation = match process_at {
            Some(_) => self.scripts.schedule.prepare_invoke(),
            None => self.scripts.enqueue.prepare_invoke(),
        };
        invocation.key(self.keys.task(msg.id));
        match process_at {
            Some(_) => invocation.key(self.keys.scheduled()),
            None => invocation.key(self.keys.queue(&msg.queue)),
        };
        invocation
            .key(self.keys.queues())
            .key(&unique_key)
            .key(self.keys.seq())
            .arg(&json)
            .arg(&id)
            .arg(&msg.queue)
            .arg(ttl);
        if let Some(at) = process_at {
            invocation.arg(millis(at));
        }

        let invocation = &invocation;
        let status: i64 = self
            .with_retry(operation, |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        match status {
            1 => Ok(()),
            -1 => Err(TaskError::DuplicateTask {
                unique_key: msg.unique_key.clone().unwrap_or_default(),
            }),
            _ => Err(TaskError::TaskIdConflict {
                task_id: msg.id.to_string(),
            }),
        }
    }

    /// Scripts answering 1 when the caller still held the task's lease
    async fn release(
        &self,
        operation: &'static str,
        msg: &TaskMessage,
        invocation: &::redis::ScriptInvocation<'_>,
    ) -> TaskResult<()> {
        let released: i64 = self
            .with_retry(operation, |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        if released == 1 {
            Ok(())
        } else {
            Err(TaskError::not_found(msg.id))
        }
    }

    async fn forward(&self, operation: &'static str, from: String, now: DateTime<Utc>) -> TaskResult<u64> {
        let mut total = 0u64;
        loop {
            let mut invocation = self.scripts.forward.prepare_invoke();
            invocation
                .key(&from)
                .key(self.keys.seq())
                .arg(millis(now))
                .arg(self.keys.task_prefix())
                .arg(self.keys.queue_prefix())
                .arg(self.config.batch_size);
            let invocation = &invocation;
            let moved: u64 = self
                .with_retry(operation, |mut conn| async move {
                    invocation.invoke_async(&mut conn).await
                })
                .await?;
            total += moved;
            if (moved as usize) < self.config.batch_size {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, msg: &TaskMessage, unique_ttl: Option<Duration>) -> TaskResult<()> {
        self.insert("enqueue", msg, None, unique_ttl).await?;
        debug!("Enqueued task {} to queue {}", msg.id, msg.queue);
        Ok(())
    }

    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique_ttl: Option<Duration>,
    ) -> TaskResult<()> {
        self.insert("schedule", msg, Some(process_at), unique_ttl).await?;
        debug!("Scheduled task {} for {}", msg.id, process_at);
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[String],
        lease_until: DateTime<Utc>,
    ) -> TaskResult<Option<TaskMessage>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let mut invocation = self.scripts.dequeue.prepare_invoke();
        invocation.key(self.keys.active());
        for name in queues {
            invocation.key(self.keys.queue(name));
        }
        let token = LeaseToken::now_v7();
        invocation
            .arg(millis(lease_until))
            .arg(self.keys.task_prefix())
            .arg(token.to_string());

        let invocation = &invocation;
        let json: Option<String> = self
            .with_retry("dequeue", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        let Some(json) = json else {
            return Ok(None);
        };
        let mut msg = TaskMessage::from_json(&json)?;
        msg.lease = Some(token);
        Ok(Some(msg))
    }

    async fn ack(&self, msg: &TaskMessage) -> TaskResult<()> {
        let mut invocation = self.scripts.ack.prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.task(msg.id))
            .key(self.keys.unique(msg.unique_key.as_deref()))
            .arg(msg.id.to_string())
            .arg(claim(msg)?);
        self.release("ack", msg, &invocation).await
    }

    async fn retry(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> TaskResult<()> {
        let mut invocation = self.scripts.retry.prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.task(msg.id))
            .key(self.keys.scheduled())
            .key(self.keys.seq())
            .arg(msg.id.to_string())
            .arg(msg.to_json()?)
            .arg(millis(process_at))
            .arg(claim(msg)?);
        self.release("retry", msg, &invocation).await
    }

    async fn fail(&self, msg: &TaskMessage) -> TaskResult<()> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.config.retention.dead_letter_max_age)
            .ok()
            .and_then(|max_age| now.checked_sub_signed(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut invocation = self.scripts.fail.prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.task(msg.id))
            .key(self.keys.dead())
            .key(self.keys.unique(msg.unique_key.as_deref()))
            .arg(msg.id.to_string())
            .arg(msg.to_json()?)
            .arg(millis(now))
            .arg(millis(cutoff))
            .arg(self.config.retention.dead_letter_max_size)
            .arg(self.keys.task_prefix())
            .arg(claim(msg)?);
        self.release("fail", msg, &invocation).await
    }

    async fn extend_lease(
        &self,
        id: TaskId,
        lease: LeaseToken,
        lease_until: DateTime<Utc>,
    ) -> TaskResult<bool> {
        let mut invocation = self.scripts.extend_lease.prepare_invoke();
        invocation
            .key(self.keys.active())
            .key(self.keys.task(id))
            .arg(id.to_string())
            .arg(millis(lease_until))
            .arg(lease.to_string());
        let invocation = &invocation;
        let extended: i64 = self
            .with_retry("extend_lease", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(extended == 1)
    }

    async fn forward_scheduled(&self, now: DateTime<Utc>) -> TaskResult<u64> {
        self.forward("forward_scheduled", self.keys.scheduled(), now).await
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> TaskResult<u64> {
        // Leases ending exactly at `now` are still held.
        self.forward(
            "recover_expired",
            self.keys.active(),
            now - chrono::Duration::milliseconds(1),
        )
        .await
    }

    async fn task_info(&self, id: TaskId) -> TaskResult<Option<TaskInfo>> {
        let key = self.keys.task(id);
        let key = &key;
        let fields: HashMap<String, String> = self
            .with_retry("task_info", |mut conn| async move {
                ::redis::cmd("HGETALL").arg(key).query_async(&mut conn).await
            })
            .await?;

        let Some(json) = fields.get("msg") else {
            return Ok(None);
        };
        let state = fields
            .get("state")
            .and_then(|s| TaskState::parse(s))
            .ok_or_else(|| TaskError::Internal(anyhow::anyhow!("task {} has no valid state", id)))?;
        let next_process_at = fields
            .get("process_at")
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(Some(TaskInfo {
            message: TaskMessage::from_json(json)?,
            state,
            next_process_at,
        }))
    }

    async fn dead_letters(&self, limit: usize) -> TaskResult<Vec<TaskMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let dead = self.keys.dead();
        let dead = &dead;
        let ids: Vec<String> = self
            .with_retry("dead_letters", |mut conn| async move {
                ::redis::cmd("ZREVRANGE")
                    .arg(dead)
                    .arg(0)
                    .arg(limit as isize - 1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        for id in &ids {
            pipe.hget(format!("{}{}", self.keys.task_prefix(), id), "msg");
        }
        let pipe = &pipe;
        let records: Vec<Option<String>> = self
            .with_retry("dead_letters", |mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        records
            .into_iter()
            .flatten()
            .map(|json| TaskMessage::from_json(&json))
            .collect()
    }

    async fn stats(&self) -> TaskResult<QueueStats> {
        let queues_key = self.keys.queues();
        let queues_key = &queues_key;
        let names: Vec<String> = self
            .with_retry("stats", |mut conn| async move {
                ::redis::cmd("SMEMBERS").arg(queues_key).query_async(&mut conn).await
            })
            .await?;

        let mut pipe = ::redis::pipe();
        for name in &names {
            pipe.zcard(self.keys.queue(name));
        }
        pipe.zcard(self.keys.scheduled())
            .zcard(self.keys.active())
            .zcard(self.keys.dead());
        let pipe = &pipe;
        let counts: Vec<u64> = self
            .with_retry("stats", |mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        let (queue_counts, set_counts) = counts.split_at(names.len());
        let [scheduled, active, dead] = <[u64; 3]>::try_from(set_counts)
            .map_err(|_| TaskError::Internal(anyhow::anyhow!("unexpected stats reply")))?;

        Ok(QueueStats {
            pending: names.into_iter().zip(queue_counts.iter().copied()).collect(),
            scheduled,
            active,
            dead,
        })
    }
}
