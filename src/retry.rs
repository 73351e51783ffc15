//! Retry and dead-letter decisions for failed tasks

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::task::{offset, TaskMessage};

/// Exponential backoff with jitter: `min(base * 2^retry_count, max) * (1 ± jitter)`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay applied as random jitter, clamped to `[0.0, 1.0]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the attempt following failure number `retry_count + 1`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.delay_without_jitter(retry_count).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        };
        Duration::from_millis((base * factor).max(0.0) as u64)
    }

    pub fn delay_without_jitter(&self, retry_count: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What happens to a task after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back to the scheduled set with `retry_count` already incremented
    Retry {
        message: TaskMessage,
        process_at: DateTime<Utc>,
    },
    /// Into the dead-letter set
    DeadLetter { message: TaskMessage },
}

/// Applies the retry policy to failed tasks and records the outcome in the broker
#[derive(Clone)]
pub struct FailureManager {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl FailureManager {
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide between retry and dead-letter.
    ///
    /// Permanent errors and a passed deadline dead-letter the task whatever
    /// the remaining budget; otherwise the task is retried while
    /// `retry_count < max_retry`.
    pub fn decide(&self, msg: &TaskMessage, error: &TaskError, now: DateTime<Utc>) -> RetryDecision {
        let mut message = msg.clone();
        message.record_failure(&error.to_string(), now);

        let exhausted = message.retry_count >= message.max_retry;
        if error.is_permanent() || message.is_deadline_exceeded(now) || exhausted {
            return RetryDecision::DeadLetter { message };
        }

        let delay = self.policy.delay_for(message.retry_count);
        message.retry_count += 1;
        let process_at = offset(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry {
            message,
            process_at,
        }
    }

    /// Decide and apply the outcome of a failed attempt
    pub async fn handle_failure(&self, msg: &TaskMessage, error: &TaskError) -> TaskResult<RetryDecision> {
        let decision = self.decide(msg, error, Utc::now());
        match &decision {
            RetryDecision::Retry {
                message,
                process_at,
            } => {
                self.broker.retry(message, *process_at).await?;
                info!(
                    "Task {} queued for retry {}/{} at {}: {}",
                    message.id, message.retry_count, message.max_retry, process_at, error
                );
            }
            RetryDecision::DeadLetter { message } => {
                self.broker.fail(message).await?;
                warn!(
                    "Task {} ({}) dead-lettered after {} retries: {}",
                    message.id, message.task_type, message.retry_count, error
                );
            }
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::task::{Task, TaskOption, TaskOptions};

    fn message(options: &[TaskOption]) -> TaskMessage {
        let now = Utc::now();
        let opts = TaskOptions::resolve(options, now).unwrap();
        TaskMessage::new(&Task::new("image:resize", b"{}".to_vec()), &opts, now)
    }

    fn manager() -> FailureManager {
        FailureManager::new(
            Arc::new(MemoryBroker::new()),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.0),
        )
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(60), 0.25);
        for _ in 0..100 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(7_500), "{delay:?}");
            assert!(delay <= Duration::from_millis(12_500), "{delay:?}");
        }
    }

    #[test]
    fn retry_count_increases_by_one_until_the_budget_is_spent() {
        let manager = manager();
        let now = Utc::now();
        let mut msg = message(&[TaskOption::MaxRetry(3)]);
        let error = TaskError::handler("boom");

        for expected in 1..=3 {
            match manager.decide(&msg, &error, now) {
                RetryDecision::Retry {
                    message,
                    process_at,
                } => {
                    assert_eq!(message.retry_count, expected);
                    assert!(process_at > now);
                    assert_eq!(message.last_error.as_deref(), Some("Handler failed: boom"));
                    msg = message;
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }

        match manager.decide(&msg, &error, now) {
            RetryDecision::DeadLetter { message } => assert_eq!(message.retry_count, 3),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[test]
    fn permanent_errors_skip_the_retry_budget() {
        let manager = manager();
        let msg = message(&[]);
        let now = Utc::now();
        for error in [
            TaskError::NoHandler {
                task_type: "image:resize".into(),
            },
            TaskError::skip_retry("bad payload"),
        ] {
            assert!(matches!(
                manager.decide(&msg, &error, now),
                RetryDecision::DeadLetter { .. }
            ));
        }
    }

    #[test]
    fn deadline_overrides_retry_budget() {
        let manager = manager();
        let now = Utc::now();
        let msg = message(&[TaskOption::Deadline(now - chrono::Duration::seconds(1))]);
        assert!(matches!(
            manager.decide(&msg, &TaskError::handler("late"), now),
            RetryDecision::DeadLetter { .. }
        ));
    }

    #[tokio::test]
    async fn handle_failure_moves_the_task_in_the_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let manager = FailureManager::new(broker.clone(), RetryPolicy::default());
        let msg = message(&[TaskOption::MaxRetry(0)]);
        broker.enqueue(&msg, None).await.unwrap();
        let claimed = broker
            .dequeue(&["default".to_string()], Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        let decision = manager
            .handle_failure(&claimed, &TaskError::handler("boom"))
            .await
            .unwrap();
        assert!(matches!(decision, RetryDecision::DeadLetter { .. }));
        let dead = broker.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].id, msg.id);
        assert_eq!(dead[0].last_error.as_deref(), Some("Handler failed: boom"));
    }
}
