//! Weighted selection of the queue to poll next

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::{TaskError, TaskResult};
use crate::task::TaskMessage;

/// Picks the poll order across weighted queues and blocks until a task is claimed
#[derive(Debug)]
pub struct PriorityDispatcher {
    /// Queues with positive weight, highest weight first
    queues: Vec<(String, u32)>,
    /// One weighted round-robin cycle of indexes into `queues`
    cycle: Vec<usize>,
    cursor: AtomicUsize,
    strict: bool,
    poll_interval: Duration,
    max_poll_interval: Duration,
}

impl PriorityDispatcher {
    /// Build a dispatcher over `queues` (name -> weight).
    ///
    /// Queues with weight 0 are never polled. With `strict` set, higher
    /// weight queues are always drained first.
    pub fn new(queues: &HashMap<String, u32>, strict: bool) -> TaskResult<Self> {
        let mut weighted: Vec<(String, u32)> = queues
            .iter()
            .filter(|(_, weight)| **weight > 0)
            .map(|(name, weight)| (name.clone(), *weight))
            .collect();
        if weighted.is_empty() {
            return Err(TaskError::config("at least one queue needs a positive weight"));
        }
        weighted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let cycle = smooth_cycle(&weighted);
        Ok(Self {
            queues: weighted,
            cycle,
            cursor: AtomicUsize::new(0),
            strict,
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(1),
        })
    }

    /// Set the idle backoff bounds used by [`PriorityDispatcher::next`]
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_interval = initial;
        self.max_poll_interval = max.max(initial);
        self
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Queue order for one dequeue attempt.
    ///
    /// The queue owning the next slot of the cycle comes first, followed by
    /// the rest by weight, so an empty favourite never blocks work elsewhere.
    pub fn poll_order(&self) -> Vec<String> {
        if self.strict {
            return self.queue_names();
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.cycle.len();
        let first = self.cycle[slot];
        let mut order = Vec::with_capacity(self.queues.len());
        order.push(self.queues[first].0.clone());
        order.extend(
            self.queues
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != first)
                .map(|(_, (name, _))| name.clone()),
        );
        order
    }

    /// Block until a task is claimed or `shutdown` fires.
    ///
    /// Idle polls back off from the poll interval up to the maximum;
    /// connectivity errors back off the same way. Returns `None` on shutdown.
    pub async fn next(
        &self,
        broker: &dyn Broker,
        lease_duration: Duration,
        shutdown: &CancellationToken,
    ) -> TaskResult<Option<TaskMessage>> {
        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|_| TaskError::config("lease duration out of range"))?;
        let mut backoff = self.poll_interval;
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            let order = self.poll_order();
            let lease_until = Utc::now()
                .checked_add_signed(lease)
                .ok_or_else(|| TaskError::config("lease duration out of range"))?;
            match broker.dequeue(&order, lease_until).await {
                Ok(Some(msg)) => {
                    debug!("Dispatching task {} from queue {}", msg.id, msg.queue);
                    return Ok(Some(msg));
                }
                Ok(None) => {}
                Err(TaskError::BrokerUnavailable { reason }) => {
                    warn!("Dequeue failed, broker unavailable: {}", reason);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_poll_interval);
        }
    }
}

/// Smooth weighted round-robin over one full cycle of `sum(weights)` slots.
/// Each queue appears exactly `weight` times, spread out rather than batched.
fn smooth_cycle(queues: &[(String, u32)]) -> Vec<usize> {
    let total: i64 = queues.iter().map(|(_, w)| *w as i64).sum();
    let mut current = vec![0i64; queues.len()];
    let mut cycle = Vec::with_capacity(total as usize);
    for _ in 0..total {
        for (i, (_, weight)) in queues.iter().enumerate() {
            current[i] += *weight as i64;
        }
        let mut best = 0;
        for i in 1..current.len() {
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        cycle.push(best);
    }
    cycle
}
