//! Background loops promoting due tasks and recovering expired leases

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::TaskResult;

/// Moves due tasks from the scheduled set into their queues on a fixed tick
pub struct TaskScheduler {
    broker: Arc<dyn Broker>,
    tick: Duration,
}

impl TaskScheduler {
    pub fn new(broker: Arc<dyn Broker>, tick: Duration) -> Self {
        Self { broker, tick }
    }

    /// Run one promotion pass. Safe to repeat: tasks already moved are not
    /// seen again.
    pub async fn tick(&self) -> TaskResult<u64> {
        let forwarded = self.broker.forward_scheduled(Utc::now()).await?;
        if forwarded > 0 {
            info!("Moved {} scheduled tasks to their queues", forwarded);
        }
        Ok(forwarded)
    }

    /// Tick until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Scheduler started (tick {:?})", self.tick);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Failed to forward scheduled tasks: {}", e);
                    }
                }
            }
        }
        debug!("Scheduler stopped");
    }
}

/// Returns tasks whose worker stopped renewing the lease to their queue
pub struct LeaseRecoverer {
    broker: Arc<dyn Broker>,
    interval: Duration,
}

impl LeaseRecoverer {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self { broker, interval }
    }

    pub async fn recover(&self) -> TaskResult<u64> {
        let recovered = self.broker.recover_expired(Utc::now()).await?;
        if recovered > 0 {
            warn!("Recovered {} tasks with expired leases", recovered);
        }
        Ok(recovered)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.recover().await {
                        error!("Failed to recover expired leases: {}", e);
                    }
                }
            }
        }
        debug!("Lease recoverer stopped");
    }
}
