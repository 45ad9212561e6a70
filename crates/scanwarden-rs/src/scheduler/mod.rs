//! Cadence-driven and on-demand dispatch of scan batches.
//!
//! Settings are read from the store on every tick, so changes made through
//! the API apply without restarting the loop.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Days, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    db::SettingsStore,
    error::{Result, ScanError},
    executor::{JobExecutor, TargetRun},
    models::{Frequency, NotifyMode, SchedulerSettings},
    notify::{format_scan_failure, format_scan_summary, Notifier},
    settings::{load_scheduler_settings, save_last_run, SchedulerSettingsPatch},
};

/// Next run as shown to operators.
///
/// `24h` runs at the next `hour_of_day:00` strictly after `now`; the other
/// frequencies run one interval after `last_run`. Returns `None` when the
/// scheduler is disabled, or when an interval schedule has never run.
pub fn compute_next_run<Tz: TimeZone>(settings: &SchedulerSettings, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
    if !settings.enabled {
        return None;
    }
    match settings.frequency {
        Frequency::Daily => next_daily_slot(settings.hour_of_day, &now),
        other => settings
            .last_run
            .map(|last| last.with_timezone(&now.timezone()) + other.interval()),
    }
}

fn next_daily_slot<Tz: TimeZone>(hour: u32, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0)?;
    let tz = after.timezone();
    let today = after.date_naive();
    [Some(today), today.checked_add_days(Days::new(1)), today.checked_add_days(Days::new(2))]
        .into_iter()
        .flatten()
        .filter_map(|day| tz.from_local_datetime(&day.and_time(time)).earliest())
        .find(|slot| slot > after)
}

/// The slot the current cycle is waiting for: the first one after the last
/// run.
fn due_at(settings: &SchedulerSettings, tz: &FixedOffset) -> Option<DateTime<Utc>> {
    let last = settings.last_run?;
    match settings.frequency {
        Frequency::Daily => {
            next_daily_slot(settings.hour_of_day, &last.with_timezone(tz)).map(|t| t.with_timezone(&Utc))
        }
        other => Some(last + other.interval()),
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Disabled,
    /// First enabled tick without a previous run; the schedule starts now.
    Armed,
    NotDue { next_run: DateTime<Utc> },
    AlreadyProcessing,
    /// Settings could not be read or persisted; retried on the next tick.
    SettingsUnavailable,
    Dispatched(JoinHandle<BatchSummary>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchSummary {
    pub targets: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub new_findings: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub processing: bool,
    pub current_target: Option<String>,
    pub active_targets: Vec<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub settings: SchedulerSettings,
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn SettingsStore>,
    executor: JobExecutor,
    notifier: Arc<dyn Notifier>,
    tz: FixedOffset,
    scheduled_running: Arc<AtomicBool>,
    active_batches: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SettingsStore>, executor: JobExecutor, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            executor,
            notifier,
            tz: Utc.fix(),
            scheduled_running: Arc::default(),
            active_batches: Arc::default(),
        }
    }

    /// Offset `hour_of_day` is interpreted in.
    pub fn with_offset(mut self, tz: FixedOffset) -> Self {
        self.tz = tz;
        self
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let settings = match load_scheduler_settings(self.store.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "scheduler tick skipped: settings unavailable");
                return TickOutcome::SettingsUnavailable;
            }
        };
        if !settings.enabled {
            return TickOutcome::Disabled;
        }

        let Some(due) = due_at(&settings, &self.tz) else {
            if let Err(e) = save_last_run(self.store.as_ref(), now).await {
                warn!(error = %e, "scheduler tick skipped: could not arm schedule");
                return TickOutcome::SettingsUnavailable;
            }
            info!(frequency = %settings.frequency, "schedule armed");
            return TickOutcome::Armed;
        };
        if now < due {
            return TickOutcome::NotDue { next_run: due };
        }
        if self
            .scheduled_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("previous scheduled batch still running, skipping");
            return TickOutcome::AlreadyProcessing;
        }
        if let Err(e) = save_last_run(self.store.as_ref(), now).await {
            self.scheduled_running.store(false, Ordering::SeqCst);
            warn!(error = %e, "scheduler tick skipped: could not persist last run");
            return TickOutcome::SettingsUnavailable;
        }

        info!(due = %due, "scheduled batch dispatched");
        let this = self.clone();
        TickOutcome::Dispatched(tokio::spawn(async move {
            let summary = this.run_batch(settings.notify_mode).await;
            this.scheduled_running.store(false, Ordering::SeqCst);
            summary
        }))
    }

    /// Runs a batch right away. Cadence, `enabled` and `last_run` are left
    /// alone; targets already in flight are skipped.
    pub async fn trigger_manual_run(&self) -> Result<JoinHandle<BatchSummary>> {
        let settings = load_scheduler_settings(self.store.as_ref()).await?;
        info!("manual batch dispatched");
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run_batch(settings.notify_mode).await }))
    }

    /// Takes effect on the next batch; a job already running is not touched.
    pub async fn toggle_target(&self, target_id: i64, enabled: bool) -> Result<()> {
        self.executor.db().set_scheduler_enabled(target_id, enabled).await?;
        info!(target_id, enabled, "target scheduling toggled");
        Ok(())
    }

    pub async fn toggle_tool_for_target(&self, target_id: i64, enabled: bool) -> Result<()> {
        self.executor.db().set_tool_enabled(target_id, enabled).await?;
        info!(target_id, enabled, "secondary probe toggled");
        Ok(())
    }

    pub async fn update_settings(&self, patch: &SchedulerSettingsPatch) -> Result<SchedulerSettings> {
        let settings = patch.apply(self.store.as_ref()).await?;
        info!(
            enabled = settings.enabled,
            frequency = %settings.frequency,
            hour = settings.hour_of_day,
            "scheduler settings updated"
        );
        Ok(settings)
    }

    pub async fn status(&self, now: DateTime<Utc>) -> Result<SchedulerStatus> {
        let settings = load_scheduler_settings(self.store.as_ref()).await?;
        let next_run = match due_at(&settings, &self.tz) {
            Some(due) if settings.enabled => Some(due.max(now)),
            _ => compute_next_run(&settings, now.with_timezone(&self.tz)).map(|t| t.with_timezone(&Utc)),
        };
        let active_targets = self.executor.active_targets();
        Ok(SchedulerStatus {
            processing: self.active_batches.load(Ordering::SeqCst) > 0
                || self.scheduled_running.load(Ordering::SeqCst),
            current_target: active_targets.first().cloned(),
            active_targets,
            next_run,
            settings,
        })
    }

    /// Drives `tick` on a fixed interval until `shutdown` fires.
    pub async fn run_loop(self, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(every_secs = every.as_secs(), "scheduler loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        TickOutcome::NotDue { next_run } => debug!(%next_run, "not due"),
                        outcome => debug!(?outcome, "tick"),
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    }

    async fn run_batch(&self, notify_mode: NotifyMode) -> BatchSummary {
        self.active_batches.fetch_add(1, Ordering::SeqCst);
        let targets = match self.executor.db().scheduler_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "could not load scheduler targets");
                self.active_batches.fetch_sub(1, Ordering::SeqCst);
                return BatchSummary::default();
            }
        };
        if targets.is_empty() {
            info!("no targets enabled for scheduling");
        }

        let runs = self.executor.run_batch(targets).await;
        let mut summary = BatchSummary {
            targets: runs.len(),
            ..BatchSummary::default()
        };
        for run in &runs {
            match &run.result {
                Ok(outcome) => {
                    summary.completed += 1;
                    summary.new_findings += outcome.report.inserted;
                }
                Err(ScanError::AlreadyRunning(_)) => summary.skipped += 1,
                Err(_) => summary.failed += 1,
            }
            self.notify(run, notify_mode).await;
        }
        self.active_batches.fetch_sub(1, Ordering::SeqCst);
        info!(?summary, "batch summary");
        summary
    }

    async fn notify(&self, run: &TargetRun, mode: NotifyMode) {
        let message = match &run.result {
            Ok(outcome) if mode == NotifyMode::Always || outcome.report.inserted > 0 => {
                format_scan_summary(&run.target, &outcome.report, &outcome.new_findings)
            }
            Err(e) if mode == NotifyMode::Always && !matches!(e, ScanError::AlreadyRunning(_)) => {
                format_scan_failure(&run.target, &e.to_string())
            }
            _ => {
                debug!(target = %run.target, "notification skipped by notify mode");
                return;
            }
        };
        if let Err(e) = self.notifier.notify(&message).await {
            warn!(target = %run.target, error = %e, "notification failed");
        }
    }
}
