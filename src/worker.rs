//! Worker pool pulling tasks from the broker and running them through a handler

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::dispatcher::PriorityDispatcher;
use crate::error::{TaskError, TaskResult};
use crate::handler::{Handler, TaskContext};
use crate::retry::{FailureManager, RetryDecision, RetryPolicy};
use crate::scheduler::{LeaseRecoverer, TaskScheduler};
use crate::task::{offset, LeaseToken, TaskId, TaskMessage, DEFAULT_QUEUE};

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of tasks processed in parallel
    pub concurrency: usize,
    /// Queues to serve and their weights
    pub queues: HashMap<String, u32>,
    /// Always drain higher weight queues first instead of weighted round-robin
    pub strict_priority: bool,
    /// Grace period for in-flight tasks once shutdown is signalled
    pub shutdown_timeout: Duration,
    /// Lease granted on each claim, renewed every third of its length
    pub lease_duration: Duration,
    /// Tick of the scheduled-task mover
    pub scheduler_interval: Duration,
    /// How often expired leases are looked for
    pub recoverer_interval: Duration,
    /// First backoff when all queues are empty
    pub poll_interval: Duration,
    /// Cap of the empty-queue backoff
    pub max_poll_interval: Duration,
    /// Timeout applied to tasks enqueued without one
    pub default_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queues: HashMap::from([(DEFAULT_QUEUE.to_string(), 1)]),
            strict_priority: false,
            shutdown_timeout: Duration::from_secs(8),
            lease_duration: Duration::from_secs(30),
            scheduler_interval: Duration::from_secs(1),
            recoverer_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            max_poll_interval: Duration::from_secs(1),
            default_timeout: Some(Duration::from_secs(30 * 60)),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> TaskResult<()> {
        if self.concurrency == 0 {
            return Err(TaskError::config("concurrency must be at least 1"));
        }
        if self.lease_duration < Duration::from_millis(3) {
            return Err(TaskError::config("lease duration must be at least 3ms"));
        }
        for (name, interval) in [
            ("scheduler_interval", self.scheduler_interval),
            ("recoverer_interval", self.recoverer_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if interval.is_zero() {
                return Err(TaskError::config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub average_execution_time_ms: f64,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WorkerStats {
    fn record_execution(&mut self, elapsed: Duration) {
        self.tasks_processed += 1;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.average_execution_time_ms +=
            (elapsed_ms - self.average_execution_time_ms) / self.tasks_processed as f64;
    }
}

/// How one attempt ended
#[derive(Debug)]
enum Outcome {
    Succeeded,
    Failed(TaskError),
    /// The worker gave up the task without recording anything; it comes back
    /// once its lease expires
    Abandoned,
}

/// Turn a handler error back into the crate taxonomy
fn classify(err: anyhow::Error) -> TaskError {
    match err.downcast::<TaskError>() {
        Ok(task_error) => task_error,
        Err(other) => TaskError::handler(format!("{:#}", other)),
    }
}

/// One execution unit's view of the pool
#[derive(Clone)]
struct Processor {
    worker_id: WorkerId,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn Handler>,
    dispatcher: Arc<PriorityDispatcher>,
    failures: FailureManager,
    stats: Arc<Mutex<WorkerStats>>,
    lease_duration: Duration,
    default_timeout: Option<Duration>,
    /// Stop claiming new tasks
    shutdown: CancellationToken,
    /// Abandon in-flight tasks
    force: CancellationToken,
}

impl Processor {
    async fn run(self, unit: usize) {
        debug!("Worker {} unit {} started", self.worker_id, unit);
        loop {
            let next = self
                .dispatcher
                .next(self.broker.as_ref(), self.lease_duration, &self.shutdown)
                .await;
            match next {
                Ok(Some(msg)) => self.process(msg).await,
                Ok(None) => break,
                Err(e) => {
                    error!("Worker {} unit {} failed to dequeue: {}", self.worker_id, unit, e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        debug!("Worker {} unit {} stopped", self.worker_id, unit);
    }

    async fn process(&self, msg: TaskMessage) {
        let started = Instant::now();
        let outcome = if msg.is_deadline_exceeded(Utc::now()) {
            Outcome::Failed(TaskError::DeadlineExceeded {
                task_id: msg.id.to_string(),
            })
        } else {
            self.execute(&msg).await
        };
        let elapsed = started.elapsed();

        match outcome {
            Outcome::Succeeded => {
                match self.broker.ack(&msg).await {
                    Ok(()) => info!("Task {} ({}) completed in {:?}", msg.id, msg.task_type, elapsed),
                    Err(TaskError::TaskNotFound { .. }) => {
                        warn!("Task {} completed after its lease was lost", msg.id)
                    }
                    Err(e) => error!("Failed to ack task {}: {}", msg.id, e),
                }
                let mut stats = self.stats.lock().await;
                stats.record_execution(elapsed);
                stats.tasks_successful += 1;
            }
            Outcome::Failed(err) => {
                warn!("Task {} ({}) failed: {}", msg.id, msg.task_type, err);
                let decision = self.failures.handle_failure(&msg, &err).await;
                let mut stats = self.stats.lock().await;
                stats.record_execution(elapsed);
                stats.tasks_failed += 1;
                match decision {
                    Ok(RetryDecision::Retry { .. }) => stats.tasks_retried += 1,
                    Ok(RetryDecision::DeadLetter { .. }) => stats.tasks_dead_lettered += 1,
                    Err(e) => error!("Failed to record failure of task {}: {}", msg.id, e),
                }
            }
            Outcome::Abandoned => {
                info!("Task {} abandoned; it will be redelivered after its lease expires", msg.id);
            }
        }
    }

    async fn execute(&self, msg: &TaskMessage) -> Outcome {
        let now = Utc::now();
        let timeout = msg.effective_timeout(self.default_timeout, now);
        let attempt_deadline = timeout.and_then(|t| offset(now, t).ok());

        let cancel = self.force.child_token();
        let lease_lost = CancellationToken::new();
        let ctx = TaskContext::new(msg, attempt_deadline, cancel.clone());

        let handler = self.handler.clone();
        let task = msg.task();
        let mut job = tokio::spawn(async move { handler.process_task(ctx, task).await });
        let keeper = self.keep_lease(msg.id, msg.lease, lease_lost.clone());

        let expired = async {
            match timeout {
                Some(t) => sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            joined = &mut job => match joined {
                Ok(Ok(())) => Outcome::Succeeded,
                Ok(Err(e)) => Outcome::Failed(classify(e)),
                Err(e) if e.is_panic() => Outcome::Failed(TaskError::handler("handler panicked")),
                Err(e) => Outcome::Failed(TaskError::handler(e.to_string())),
            },
            _ = expired => {
                cancel.cancel();
                job.abort();
                if msg.is_deadline_exceeded(Utc::now()) {
                    Outcome::Failed(TaskError::DeadlineExceeded { task_id: msg.id.to_string() })
                } else {
                    Outcome::Failed(TaskError::Timeout {
                        task_id: msg.id.to_string(),
                        timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
                    })
                }
            }
            _ = lease_lost.cancelled() => {
                cancel.cancel();
                job.abort();
                Outcome::Abandoned
            }
            _ = self.force.cancelled() => {
                job.abort();
                Outcome::Abandoned
            }
        };
        keeper.abort();
        outcome
    }

    /// Extend the lease every third of its duration until aborted.
    /// Fires `lost` when the broker no longer holds the task under `token`.
    fn keep_lease(
        &self,
        id: TaskId,
        token: Option<LeaseToken>,
        lost: CancellationToken,
    ) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let lease = self.lease_duration;
        tokio::spawn(async move {
            let Some(token) = token else {
                warn!("Task {} was delivered without a lease token", id);
                lost.cancel();
                return;
            };
            let mut ticker = interval(lease / 3);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(until) = offset(Utc::now(), lease) else {
                    return;
                };
                match broker.extend_lease(id, token, until).await {
                    Ok(true) => debug!("Extended lease of task {}", id),
                    Ok(false) => {
                        warn!("Lease of task {} was lost", id);
                        lost.cancel();
                        return;
                    }
                    Err(e) => warn!("Failed to extend lease of task {}: {}", id, e),
                }
            }
        })
    }
}

/// Fixed-size pool of execution units sharing one broker
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a new worker with the given configuration
    pub fn new(config: WorkerConfig, broker: Arc<dyn Broker>) -> TaskResult<Self> {
        config.validate()?;
        Ok(Self {
            id: WorkerId::now_v7(),
            config,
            broker,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Token that stops the worker when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal worker to shutdown
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get worker statistics
    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Process tasks with `handler` until shutdown is signalled, then drain.
    ///
    /// In-flight tasks get `shutdown_timeout` to finish; whatever is still
    /// running afterwards is cancelled and left to lease expiry.
    pub async fn run<H>(&self, handler: H) -> TaskResult<()>
    where
        H: Handler + 'static,
    {
        let dispatcher = PriorityDispatcher::new(&self.config.queues, self.config.strict_priority)?
            .with_poll_interval(self.config.poll_interval, self.config.max_poll_interval);
        info!(
            "Starting worker {} with {} units for queues {:?}",
            self.id,
            self.config.concurrency,
            dispatcher.queue_names()
        );
        self.stats.lock().await.started_at = Some(Utc::now());

        let force = CancellationToken::new();
        let processor = Processor {
            worker_id: self.id,
            broker: self.broker.clone(),
            handler: Arc::new(handler),
            dispatcher: Arc::new(dispatcher),
            failures: FailureManager::new(self.broker.clone(), self.config.retry_policy.clone()),
            stats: self.stats.clone(),
            lease_duration: self.config.lease_duration,
            default_timeout: self.config.default_timeout,
            shutdown: self.shutdown.clone(),
            force: force.clone(),
        };

        let mut background = JoinSet::new();
        let scheduler = TaskScheduler::new(self.broker.clone(), self.config.scheduler_interval);
        let shutdown = self.shutdown.clone();
        background.spawn(async move { scheduler.run(shutdown).await });
        let recoverer = LeaseRecoverer::new(self.broker.clone(), self.config.recoverer_interval);
        let shutdown = self.shutdown.clone();
        background.spawn(async move { recoverer.run(shutdown).await });

        let mut units = JoinSet::new();
        for unit in 0..self.config.concurrency {
            units.spawn(processor.clone().run(unit));
        }

        self.shutdown.cancelled().await;
        info!(
            "Worker {} shutting down, waiting up to {:?} for in-flight tasks",
            self.id, self.config.shutdown_timeout
        );

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while units.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Worker {} grace period elapsed, cancelling in-flight tasks", self.id);
            force.cancel();
            while units.join_next().await.is_some() {}
        }
        while background.join_next().await.is_some() {}

        info!("Worker {} shut down complete", self.id);
        Ok(())
    }

    /// Like [`Worker::run`], shutting down once `signal` resolves
    pub async fn run_until<H, F>(&self, handler: H, signal: F) -> TaskResult<()>
    where
        H: Handler + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let id = self.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = signal => {
                    info!("Worker {} received shutdown signal", id);
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
        self.run(handler).await
    }

    /// Like [`Worker::run`], shutting down on Ctrl-C or SIGTERM
    pub async fn run_until_signal<H>(&self, handler: H) -> TaskResult<()>
    where
        H: Handler + 'static,
    {
        self.run_until(handler, termination()).await
    }
}

/// Resolves on the first interrupt or terminate signal
async fn termination() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
