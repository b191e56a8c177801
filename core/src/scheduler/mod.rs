use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{debug, info, warn};

use crate::error::{BackupError, Result};
use crate::store::schedules::BackupSchedule;

/// Parses a 6-field, second-resolution cron expression
/// (`sec min hour dom mon dow`).
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 6 {
        return Err(BackupError::BadCron {
            expr: expr.to_string(),
            reason: format!("expected 6 fields (sec min hour dom mon dow), got {fields}"),
        });
    }
    Schedule::from_str(expr).map_err(|e| BackupError::BadCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// First fire time strictly after `after`, UTC.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Work performed when a schedule fires. The orchestrator implements this;
/// implementations must never panic — a firing's failure is logged and
/// notified, not propagated.
#[async_trait]
pub trait ScheduleRunner: Send + Sync + 'static {
    async fn run_schedule(&self, schedule: BackupSchedule);
}

struct JobHandle {
    task: tokio::task::JoinHandle<()>,
}

/// In-process cron engine. One tokio task per registered schedule sleeps
/// until the next fire and invokes the runner. Firings of different
/// schedules run concurrently; firings of the same schedule are serialized
/// by the task's own loop.
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) the job for `schedule`. Rejects invalid cron
    /// expressions before touching the job map.
    pub fn register(
        &self,
        schedule: &BackupSchedule,
        runner: Arc<dyn ScheduleRunner>,
    ) -> Result<()> {
        let parsed = parse_cron(&schedule.cron_expr)?;
        let entry = schedule.clone();

        let task = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_fire(&parsed, now) else {
                    warn!(
                        "cron '{}' has no future fire times; job for schedule {} stops",
                        entry.cron_expr, entry.id
                    );
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                debug!(
                    "schedule {} sleeps until {} ({}s)",
                    entry.id,
                    next,
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
                runner.run_schedule(entry.clone()).await;
            }
        });

        let mut jobs = self.jobs.lock().unwrap();
        if let Some(previous) = jobs.insert(schedule.id.clone(), JobHandle { task }) {
            previous.task.abort();
        }
        Ok(())
    }

    /// Drops the job for a schedule, if any. Disabling or deleting a
    /// schedule that was never registered is not an error.
    pub fn remove(&self, schedule_id: &str) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(handle) = jobs.remove(schedule_id) {
            handle.task.abort();
            info!("unregistered schedule {schedule_id}");
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_registered(&self, schedule_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(schedule_id)
    }

    /// Aborts every job. Used at process shutdown.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, handle) in jobs.drain() {
            handle.task.abort();
        }
    }
}
