//! Recurring task submission
//!
//! A [`PeriodicScheduler`] holds named entries and enqueues a fresh task for
//! each one whenever its schedule comes due. Each run's task id is derived
//! from the entry name and run time, so several processes running the same
//! entries submit each run once.

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::client::TaskClient;
use crate::error::{TaskError, TaskResult};
use crate::task::{Task, TaskOption};

/// When a periodic entry fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Every fixed interval, starting one interval after registration
    Every(std::time::Duration),
    /// Daily at `hour:minute` UTC
    Daily { hour: u32, minute: u32 },
    /// Weekly on `weekday` at `hour:minute` UTC
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl Schedule {
    /// First firing time strictly after `from`
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(every) => {
                if every.is_zero() {
                    return None;
                }
                from.checked_add_signed(Duration::from_std(*every).ok()?)
            }
            Schedule::Daily { hour, minute } => {
                let mut next = from.date_naive().and_hms_opt(*hour, *minute, 0)?.and_utc();
                if next <= from {
                    next += Duration::days(1);
                }
                Some(next)
            }
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let today = from.weekday().num_days_from_monday() as i64;
                let target = weekday.num_days_from_monday() as i64;
                let days_ahead = (target - today).rem_euclid(7);
                let mut next = from.date_naive().and_hms_opt(*hour, *minute, 0)?.and_utc()
                    + Duration::days(days_ahead);
                if next <= from {
                    next += Duration::weeks(1);
                }
                Some(next)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PeriodicEntry {
    name: String,
    schedule: Schedule,
    task: Task,
    options: Vec<TaskOption>,
    next_run: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    run_count: u64,
}

/// Public view of a registered entry
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicEntryInfo {
    pub name: String,
    pub schedule: Schedule,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

/// Enqueues registered tasks on their schedules
pub struct PeriodicScheduler {
    client: Arc<TaskClient>,
    entries: RwLock<Vec<PeriodicEntry>>,
    tick: std::time::Duration,
}

impl PeriodicScheduler {
    pub fn new(client: Arc<TaskClient>, tick: std::time::Duration) -> Self {
        Self {
            client,
            entries: RwLock::new(Vec::new()),
            tick,
        }
    }

    /// Register a named entry. Names are unique.
    pub async fn register(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        task: Task,
        options: Vec<TaskOption>,
    ) -> TaskResult<DateTime<Utc>> {
        let name = name.into();
        let next_run = schedule
            .next_after(Utc::now())
            .ok_or_else(|| TaskError::config(format!("schedule of {} never fires", name)))?;
        if options
            .iter()
            .any(|o| matches!(o, TaskOption::TaskId(_) | TaskOption::ProcessIn(_) | TaskOption::ProcessAt(_)))
        {
            return Err(TaskError::config(
                "periodic entries pick their own task id and process time",
            ));
        }

        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.name == name) {
            return Err(TaskError::config(format!("periodic entry {} already exists", name)));
        }
        info!("Registered periodic entry {} ({:?}), next run {}", name, schedule, next_run);
        entries.push(PeriodicEntry {
            name,
            schedule,
            task,
            options,
            next_run,
            last_run: None,
            run_count: 0,
        });
        Ok(next_run)
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        entries.len() != before
    }

    pub async fn entries(&self) -> Vec<PeriodicEntryInfo> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| PeriodicEntryInfo {
                name: e.name.clone(),
                schedule: e.schedule.clone(),
                next_run: e.next_run,
                last_run: e.last_run,
                run_count: e.run_count,
            })
            .collect()
    }

    /// Enqueue every entry due at `now`; returns how many tasks were submitted
    pub async fn run_pending(&self, now: DateTime<Utc>) -> TaskResult<usize> {
        let mut entries = self.entries.write().await;
        let mut submitted = 0;
        for entry in entries.iter_mut().filter(|e| e.next_run <= now) {
            let run_key = format!("{}:{}", entry.name, entry.next_run.timestamp_millis());
            let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, run_key.as_bytes());
            let mut options = entry.options.clone();
            options.push(TaskOption::TaskId(id));

            match self.client.enqueue(&entry.task, &options).await {
                Ok(result) => {
                    debug!("Periodic entry {} enqueued task {}", entry.name, result.id);
                    submitted += 1;
                }
                // Another process already submitted this run.
                Err(TaskError::TaskIdConflict { .. }) => {
                    debug!("Periodic entry {} run already enqueued", entry.name);
                }
                Err(TaskError::DuplicateTask { .. }) => {
                    debug!("Periodic entry {} skipped, previous run still holds its lock", entry.name);
                }
                Err(e) => {
                    error!("Periodic entry {} failed to enqueue: {}", entry.name, e);
                    continue;
                }
            }
            entry.last_run = Some(now);
            entry.run_count += 1;
            match entry.schedule.next_after(now) {
                Some(next) => entry.next_run = next,
                None => entry.next_run = DateTime::<Utc>::MAX_UTC,
            }
        }
        Ok(submitted)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pending(Utc::now()).await {
                        error!("Periodic scheduler pass failed: {}", e);
                    }
                }
            }
        }
        debug!("Periodic scheduler stopped");
    }
}
