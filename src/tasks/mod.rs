//! Scheduled maintenance tasks
//!
//! Every run of a task holds the task's named lock in the `tasks` namespace,
//! so overlapping schedules (in this process or another one sharing the
//! store) execute one at a time.

mod pool_top_up;
mod runner;

pub use pool_top_up::PoolTopUpTask;
pub use runner::TaskRunner;

use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// When a task runs
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed delay between the end of one run and the start of the next
    Every(Duration),
    /// Wall-clock times (UTC) from a cron expression with a seconds field
    Cron {
        expression: String,
        schedule: cron::Schedule,
    },
}

impl Schedule {
    pub fn cron(expression: &str) -> RelayerResult<Self> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            RelayerError::Config(format!("invalid cron expression {}: {}", expression, e))
        })?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// Time to wait from `now` until the next run, or `None` if the schedule has no further runs
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Every(interval) => Some(*interval),
            Schedule::Cron { schedule, .. } => schedule
                .after(&now)
                .next()
                .map(|at| (at - now).to_std().unwrap_or_default()),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {:?}", interval),
            Schedule::Cron { expression, .. } => write!(f, "cron '{}'", expression),
        }
    }
}

/// A periodic maintenance routine
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique name; also the name of the task's lock
    fn name(&self) -> &str;

    /// Initial schedule
    fn schedule(&self) -> Schedule;

    /// One run. The returned message is logged.
    async fn execute(&self, ctx: &TaskContext) -> RelayerResult<String>;
}

/// Handle a running task uses to adjust its own schedule
#[derive(Clone)]
pub struct TaskContext {
    name: String,
    /// `None` once the task is stopped
    schedule: Arc<watch::Sender<Option<Schedule>>>,
}

impl TaskContext {
    fn new(name: &str, schedule: Schedule) -> Self {
        let (tx, _rx) = watch::channel(Some(schedule));
        Self {
            name: name.to_string(),
            schedule: Arc::new(tx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current schedule, or `None` if stopped
    pub fn schedule(&self) -> Option<Schedule> {
        self.schedule.borrow().clone()
    }

    /// Reschedule; takes effect after the current run
    pub fn set_schedule(&self, schedule: Schedule) {
        info!("Task {} rescheduled {}", self.name, schedule);
        self.schedule.send_replace(Some(schedule));
    }

    pub fn set_interval(&self, interval: Duration) {
        self.set_schedule(Schedule::Every(interval));
    }

    /// Stop scheduling further runs
    pub fn stop(&self) {
        info!("Task {} stopped", self.name);
        self.schedule.send_replace(None);
    }

    fn subscribe(&self) -> watch::Receiver<Option<Schedule>> {
        self.schedule.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_cron_schedule_waits_for_next_match() {
        let schedule = Schedule::cron("0 0 2 * * *").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 1, 30, 0).unwrap();
        assert_eq!(schedule.next_delay(now), Some(Duration::from_secs(30 * 60)));

        // Past today's slot: next run is tomorrow at 02:00
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 1).unwrap();
        let delay = schedule.next_delay(now).unwrap();
        let next = now + chrono::Duration::from_std(delay).unwrap();
        assert_eq!((next.ordinal(), next.hour(), next.minute()), (62, 2, 0));

        assert_eq!(schedule.to_string(), "cron '0 0 2 * * *'");
    }

    #[test]
    fn test_interval_schedule_and_invalid_cron() {
        let every = Schedule::Every(Duration::from_secs(90));
        assert_eq!(every.next_delay(Utc::now()), Some(Duration::from_secs(90)));

        assert!(matches!(
            Schedule::cron("every tuesday"),
            Err(RelayerError::Config(_))
        ));
    }

    #[test]
    fn test_context_tracks_schedule_changes() {
        let ctx = TaskContext::new("topPoolAccounts", Schedule::Every(Duration::from_secs(60)));
        let mut rx = ctx.subscribe();

        ctx.set_schedule(Schedule::cron("0 */5 * * * *").unwrap());
        assert!(rx.has_changed().unwrap());
        assert!(matches!(rx.borrow_and_update().clone(), Some(Schedule::Cron { .. })));

        ctx.stop();
        assert!(ctx.schedule().is_none());
    }
}
