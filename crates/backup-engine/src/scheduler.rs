//! Runs automatic backups and cleanup on independent timers.
//!

use core::{fmt::Display, time::Duration};
use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use shared::Tier;
use tokio::{select, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{config::ScheduleConfig, service::BackupService};

/// A task the scheduler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScheduledTask {
    /// An automatic backup of a tier.
    Backup(Tier),
    /// Deleting expired backups.
    Cleanup,
}

impl ScheduledTask {
    /// Every task the scheduler knows about.
    pub const ALL: [Self; 4] = [
        Self::Backup(Tier::Daily),
        Self::Backup(Tier::Weekly),
        Self::Backup(Tier::Monthly),
        Self::Cleanup,
    ];
}

impl Display for ScheduledTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Backup(tier) => write!(f, "{tier} backup"),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// How often each task runs.
#[derive(Debug, Clone)]
pub struct Schedule {
    #[allow(missing_docs)]
    pub daily: Duration,

    #[allow(missing_docs)]
    pub weekly: Duration,

    #[allow(missing_docs)]
    pub monthly: Duration,

    #[allow(missing_docs)]
    pub cleanup: Duration,

    /// The tiers started by [`SchedulerHandle::start`].
    pub enabled: Vec<Tier>,
}

impl Schedule {
    /// The interval of a task.
    pub fn interval(&self, task: ScheduledTask) -> Duration {
        match task {
            ScheduledTask::Backup(Tier::Daily) => self.daily,
            ScheduledTask::Backup(Tier::Weekly) => self.weekly,
            ScheduledTask::Backup(Tier::Monthly) => self.monthly,
            ScheduledTask::Cleanup => self.cleanup,
        }
    }
}

impl From<&ScheduleConfig> for Schedule {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            daily: Duration::from_secs(config.daily_seconds),
            weekly: Duration::from_secs(config.weekly_seconds),
            monthly: Duration::from_secs(config.monthly_seconds),
            cleanup: Duration::from_secs(config.cleanup_seconds),
            enabled: config.enabled.clone(),
        }
    }
}

/// What the scheduler is doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// If any task is scheduled.
    pub running: bool,

    /// The scheduled tasks.
    pub active_tasks: Vec<ScheduledTask>,
}

#[derive(Debug)]
struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the timers of every scheduled task.
///
/// Each task has its own timer, one failing or running long never delays another.
#[derive(Debug)]
pub struct SchedulerHandle {
    service: BackupService,
    schedule: Schedule,
    tasks: Mutex<BTreeMap<ScheduledTask, RunningTask>>,
}

impl SchedulerHandle {
    #[allow(missing_docs)]
    pub fn new(service: BackupService, schedule: Schedule) -> Self {
        Self {
            service,
            schedule,
            tasks: Mutex::default(),
        }
    }

    /// Start the enabled tiers and the cleanup task. Must be called from within a tokio runtime.
    pub fn start(&self) {
        for tier in self.schedule.enabled.clone() {
            self.spawn(ScheduledTask::Backup(tier));
        }
        self.spawn(ScheduledTask::Cleanup);

        info!("Scheduler started: {}", self.describe_all());
    }

    /// Start or stop a single task.
    pub fn set_enabled(&self, task: ScheduledTask, enabled: bool) {
        if enabled {
            self.spawn(task);
        } else if let Some(running) = self.lock().remove(&task) {
            running.cancel.cancel();
            info!("Stopped the {task} task");
        }
    }

    /// The currently scheduled tasks.
    pub fn status(&self) -> SchedulerStatus {
        let active_tasks: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, running)| !running.handle.is_finished())
            .map(|(task, _)| *task)
            .collect();

        SchedulerStatus {
            running: !active_tasks.is_empty(),
            active_tasks,
        }
    }

    /// A human readable description of when a task runs.
    pub fn describe(&self, task: ScheduledTask) -> String {
        let state = if self.status().active_tasks.contains(&task) {
            "active"
        } else {
            "stopped"
        };

        format!(
            "{task} {} ({state})",
            describe_interval(self.schedule.interval(task))
        )
    }

    fn describe_all(&self) -> String {
        ScheduledTask::ALL
            .iter()
            .map(|task| self.describe(*task))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Cancel every task. Runs already in progress finish in the background.
    pub fn stop(&self) {
        let tasks = core::mem::take(&mut *self.lock());

        for running in tasks.values() {
            running.cancel.cancel();
        }

        info!("Scheduler stopped");
    }

    /// Cancel every task and wait for in progress runs to finish.
    pub async fn shutdown(&self) {
        let tasks = core::mem::take(&mut *self.lock());

        for running in tasks.values() {
            running.cancel.cancel();
        }

        for (task, running) in tasks {
            if let Err(error) = running.handle.await {
                warn!("The {task} task ended abnormally: {error}");
            }
        }

        info!("Scheduler shut down");
    }

    fn spawn(&self, task: ScheduledTask) {
        let interval = self.schedule.interval(task);
        if interval.is_zero() {
            warn!("The {task} task has no interval, not scheduling it");
            return;
        }

        let mut tasks = self.lock();
        if tasks
            .get(&task)
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(
            self.service.clone(),
            task,
            interval,
            cancel.clone(),
        ));

        tasks.insert(task, RunningTask { cancel, handle });
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ScheduledTask, RunningTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run a task every `interval` until cancelled. A run is never interrupted once started.
async fn run_task(
    service: BackupService,
    task: ScheduledTask,
    interval: Duration,
    cancel: CancellationToken,
) {
    if is_overdue(&service, task, interval) {
        run_once(&service, task).await;
    }

    loop {
        select! {
            _ = cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        run_once(&service, task).await;
    }
}

/// If a task has not run within its interval.
fn is_overdue(service: &BackupService, task: ScheduledTask, interval: Duration) -> bool {
    let ScheduledTask::Backup(tier) = task else {
        return true;
    };

    let last = match service.last_tier_backup(tier) {
        Ok(Some(last)) => last,
        Ok(None) => return true,
        Err(error) => {
            warn!("[{tier}] Could not read the last backup, running now: {error}");
            return true;
        }
    };

    match (Utc::now() - last.start_time()).to_std() {
        Ok(elapsed) => elapsed >= interval,
        Err(error) => {
            warn!("[{tier}] Last backup is in the future, the system time may have changed: {error}");
            true
        }
    }
}

async fn run_once(service: &BackupService, task: ScheduledTask) {
    match task {
        ScheduledTask::Backup(tier) => match service.create_tier_backup(tier).await {
            Ok(record) => info!("[{tier}] Scheduled backup {} completed", record.id()),
            Err(error) => error!("[{tier}] Scheduled backup failed: {error}"),
        },
        ScheduledTask::Cleanup => match service.trigger_cleanup().await {
            Ok(summary) => {
                if !summary.deleted.is_empty() {
                    info!("Cleanup deleted {} backups", summary.deleted.len());
                }
            }
            Err(error) => error!("Cleanup failed: {error}"),
        },
    }
}

fn describe_interval(interval: Duration) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    let seconds = interval.as_secs();
    let (count, unit) = match seconds {
        0 => (u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "millisecond"),
        s if s % DAY == 0 => (s / DAY, "day"),
        s if s % HOUR == 0 => (s / HOUR, "hour"),
        s if s % MINUTE == 0 => (s / MINUTE, "minute"),
        s => (s, "second"),
    };

    if count == 1 {
        format!("every {unit}")
    } else {
        format!("every {count} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_intervals() {
        assert_eq!(describe_interval(Duration::from_secs(86_400)), "every day");
        assert_eq!(describe_interval(Duration::from_secs(604_800)), "every 7 days");
        assert_eq!(describe_interval(Duration::from_secs(7_200)), "every 2 hours");
        assert_eq!(describe_interval(Duration::from_secs(90)), "every 90 seconds");
        assert_eq!(describe_interval(Duration::from_millis(250)), "every 250 milliseconds");
    }
}
