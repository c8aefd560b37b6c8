//! Periodic execution of the two maintenance tasks.
//!
//! Intervals come from the settings store in minutes and are mapped onto a
//! cron trigger: sub-hour intervals run every N minutes, sub-day intervals
//! hourly on the hour, sub-week intervals daily at midnight, anything
//! larger monthly at 02:00. Tasks are not reentrant; a trigger that lands
//! while the task still runs is dropped.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::state::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    UpdateMetadata,
    FetchWanted,
}

impl TaskId {
    pub const ALL: [Self; 2] = [Self::UpdateMetadata, Self::FetchWanted];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::UpdateMetadata => "update_metadata",
            Self::FetchWanted => "fetch_wanted",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UpdateMetadata => {
                "Sync series and seasons from Sonarr and resolve source-site identifiers"
            }
            Self::FetchWanted => "Fetch missing episodes from Sonarr and queue their downloads",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub interval_minutes: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub last_error: Option<String>,
}

/// The trigger shape an interval in minutes maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTrigger {
    EveryMinutes(u32),
    HourlyEvery(u32),
    DailyEvery(u32),
    MonthlyAt0200,
}

impl TaskTrigger {
    #[must_use]
    pub fn from_minutes(minutes: u32) -> Self {
        let minutes = minutes.max(1);
        if minutes < 60 {
            Self::EveryMinutes(minutes)
        } else if minutes < 24 * 60 {
            Self::HourlyEvery(minutes / 60)
        } else if minutes < 7 * 24 * 60 {
            Self::DailyEvery(minutes / (24 * 60))
        } else {
            Self::MonthlyAt0200
        }
    }

    #[must_use]
    pub fn cron(&self) -> String {
        match self {
            Self::EveryMinutes(n) => format!("0 */{n} * * * *"),
            Self::HourlyEvery(h) => format!("0 0 */{h} * * *"),
            Self::DailyEvery(d) => format!("0 0 0 */{d} * *"),
            Self::MonthlyAt0200 => "0 0 2 1 * *".to_string(),
        }
    }

    /// The first fire time strictly after `now`, matching [`cron`](Self::cron).
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let top_of_minute = now
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .unwrap_or(now);

        match self {
            Self::EveryMinutes(n) => {
                let mut candidate = top_of_minute + Duration::minutes(1);
                while candidate.minute() % n != 0 {
                    candidate += Duration::minutes(1);
                }
                candidate
            }
            Self::HourlyEvery(h) => {
                let mut candidate = top_of_minute
                    .with_minute(0)
                    .unwrap_or(top_of_minute)
                    + Duration::hours(1);
                while candidate.hour() % h != 0 {
                    candidate += Duration::hours(1);
                }
                candidate
            }
            Self::DailyEvery(d) => {
                let midnight = top_of_minute
                    .with_minute(0)
                    .and_then(|t| t.with_hour(0))
                    .unwrap_or(top_of_minute);
                let mut candidate = midnight + Duration::days(1);
                // cron day-of-month */d fires on days 1, 1+d, 1+2d, ...
                while (candidate.day() - 1) % d != 0 {
                    candidate += Duration::days(1);
                }
                candidate
            }
            Self::MonthlyAt0200 => {
                let this_month = now
                    .with_day(1)
                    .and_then(|t| t.with_hour(2))
                    .and_then(|t| t.with_minute(0))
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                if this_month > now {
                    this_month
                } else {
                    this_month
                        .checked_add_months(chrono::Months::new(1))
                        .unwrap_or(this_month)
                }
            }
        }
    }
}

type Records = Arc<StdRwLock<HashMap<TaskId, TaskRecord>>>;

pub struct TaskScheduler {
    state: Arc<SharedState>,
    records: Records,
    triggers: HashMap<TaskId, TaskTrigger>,
    running: Arc<RwLock<bool>>,
}

impl TaskScheduler {
    /// Reads the task intervals from the settings store and prepares the
    /// task records.
    pub async fn new(state: Arc<SharedState>) -> Result<Self> {
        let mut triggers = HashMap::new();
        let mut records = HashMap::new();
        let now = Utc::now();

        for task in TaskId::ALL {
            let interval = match task {
                TaskId::UpdateMetadata => state.settings.update_metadata_interval().await?,
                TaskId::FetchWanted => state.settings.fetch_wanted_interval().await?,
            };
            let trigger = TaskTrigger::from_minutes(interval);
            records.insert(
                task,
                TaskRecord {
                    id: task.name().to_string(),
                    name: task.name().to_string(),
                    description: task.description().to_string(),
                    interval_minutes: interval,
                    last_run_at: None,
                    next_run_at: Some(trigger.next_after(now)),
                    status: TaskStatus::Idle,
                    last_error: None,
                },
            );
            triggers.insert(task, trigger);
        }

        Ok(Self {
            state,
            records: Arc::new(StdRwLock::new(records)),
            triggers,
            running: Arc::new(RwLock::new(false)),
        })
    }

    #[must_use]
    pub fn records(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> =
            self.records.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Registers both tasks with the cron scheduler and runs until
    /// [`stop`](Self::stop) is called.
    pub async fn start(&self) -> Result<()> {
        *self.running.write().await = true;

        let mut sched = JobScheduler::new().await?;

        for task in TaskId::ALL {
            let trigger = self.triggers[&task];
            let cron = trigger.cron();

            let state = Arc::clone(&self.state);
            let records = Arc::clone(&self.records);
            let running = Arc::clone(&self.running);

            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let state = Arc::clone(&state);
                let records = Arc::clone(&records);
                let running = Arc::clone(&running);
                Box::pin(async move {
                    if !*running.read().await {
                        return;
                    }
                    run_task(state, records, task, trigger).await;
                })
            })?;

            sched.add(job).await?;
            info!(task = task.name(), cron = %cron, "Task scheduled");
        }

        sched.start().await?;

        loop {
            if !*self.running.read().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        sched.shutdown().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping scheduler...");
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Manual trigger: starts the task in the background and returns
    /// immediately. A task that is already running is not started twice.
    pub fn execute_now(&self, task: TaskId) -> bool {
        {
            let records = self.records.read().unwrap();
            if records
                .get(&task)
                .is_some_and(|r| r.status == TaskStatus::Running)
            {
                debug!(task = task.name(), "Task already running, dropping trigger");
                return false;
            }
        }

        let state = Arc::clone(&self.state);
        let records = Arc::clone(&self.records);
        let trigger = self.triggers[&task];
        tokio::spawn(async move {
            run_task(state, records, task, trigger).await;
        });
        true
    }

    /// Runs both tasks back to back; used by the one-shot CLI check.
    pub async fn run_once(&self) {
        for task in TaskId::ALL {
            let trigger = self.triggers[&task];
            run_task(
                Arc::clone(&self.state),
                Arc::clone(&self.records),
                task,
                trigger,
            )
            .await;
        }
    }
}

/// Runs one task invocation to completion. Nothing escapes: the outcome
/// lands in the task record and the log, never in a panic or lost error.
async fn run_task(state: Arc<SharedState>, records: Records, task: TaskId, trigger: TaskTrigger) {
    {
        let mut records = records.write().unwrap();
        let Some(record) = records.get_mut(&task) else {
            return;
        };
        if record.status == TaskStatus::Running {
            debug!(task = task.name(), "Task already running, dropping trigger");
            return;
        }
        record.status = TaskStatus::Running;
    }

    info!(event = "job_started", job_name = task.name(), "Starting task");
    let started = Instant::now();

    let result = task_body(&state, task).await;

    let finished_at = Utc::now();
    {
        let mut records = records.write().unwrap();
        if let Some(record) = records.get_mut(&task) {
            record.last_run_at = Some(finished_at);
            record.next_run_at = Some(trigger.next_after(finished_at));
            match &result {
                Ok(()) => {
                    record.status = TaskStatus::Success;
                    record.last_error = None;
                }
                Err(e) => {
                    record.status = TaskStatus::Error;
                    record.last_error = Some(e.to_string());
                }
            }
        }
    }

    match result {
        Ok(()) => info!(
            event = "job_finished",
            job_name = task.name(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Task finished"
        ),
        Err(e) => error!(
            event = "job_failed",
            job_name = task.name(),
            error = %e,
            "Task failed"
        ),
    }
}

async fn task_body(state: &SharedState, task: TaskId) -> Result<()> {
    // A cold start has no probe verdict yet; get one before the task bails
    // out on an unknown backend.
    if !state.sonarr.health().await.healthy {
        state.sonarr.probe().await;
    }

    match task {
        TaskId::UpdateMetadata => state.metadata.full_sync().await.map(|_| ()),
        TaskId::FetchWanted => state.wanted.fetch_wanted().await.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 30).unwrap()
    }

    #[test]
    fn interval_mapping_matches_trigger_shapes() {
        assert_eq!(TaskTrigger::from_minutes(30), TaskTrigger::EveryMinutes(30));
        assert_eq!(TaskTrigger::from_minutes(59), TaskTrigger::EveryMinutes(59));
        assert_eq!(TaskTrigger::from_minutes(60), TaskTrigger::HourlyEvery(1));
        assert_eq!(TaskTrigger::from_minutes(120), TaskTrigger::HourlyEvery(2));
        assert_eq!(TaskTrigger::from_minutes(1439), TaskTrigger::HourlyEvery(23));
        assert_eq!(TaskTrigger::from_minutes(1440), TaskTrigger::DailyEvery(1));
        assert_eq!(TaskTrigger::from_minutes(4320), TaskTrigger::DailyEvery(3));
        assert_eq!(
            TaskTrigger::from_minutes(7 * 24 * 60),
            TaskTrigger::MonthlyAt0200
        );
    }

    #[test]
    fn cron_expressions() {
        assert_eq!(TaskTrigger::EveryMinutes(30).cron(), "0 */30 * * * *");
        assert_eq!(TaskTrigger::HourlyEvery(2).cron(), "0 0 */2 * * *");
        assert_eq!(TaskTrigger::DailyEvery(3).cron(), "0 0 0 */3 * *");
        assert_eq!(TaskTrigger::MonthlyAt0200.cron(), "0 0 2 1 * *");
    }

    #[test]
    fn next_fire_every_minutes() {
        let trigger = TaskTrigger::EveryMinutes(15);
        assert_eq!(
            trigger.next_after(at(2025, 3, 10, 14, 7)),
            Utc.with_ymd_and_hms(2025, 3, 10, 14, 15, 0).unwrap()
        );
        // sitting exactly on a boundary moves to the next one
        assert_eq!(
            trigger.next_after(at(2025, 3, 10, 14, 45)),
            Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_fire_hourly_and_daily() {
        assert_eq!(
            TaskTrigger::HourlyEvery(2).next_after(at(2025, 3, 10, 13, 20)),
            Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap()
        );
        assert_eq!(
            TaskTrigger::DailyEvery(1).next_after(at(2025, 3, 10, 13, 20)),
            Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap()
        );
        // day-of-month stepping: */3 fires on the 1st, 4th, 7th, ...
        assert_eq!(
            TaskTrigger::DailyEvery(3).next_after(at(2025, 3, 2, 5, 0)),
            Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_fire_monthly() {
        assert_eq!(
            TaskTrigger::MonthlyAt0200.next_after(at(2025, 3, 10, 13, 20)),
            Utc.with_ymd_and_hms(2025, 4, 1, 2, 0, 0).unwrap()
        );
        assert_eq!(
            TaskTrigger::MonthlyAt0200.next_after(at(2025, 3, 1, 1, 0)),
            Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap()
        );
    }
}
