use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempo_core::config::PopulatorConfig;
use tempo_core::PeriodicTask;
use tempo_store::{PeriodicTaskStore, StoreError, TaskStore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crontab::CronExpression;
use crate::error::{Result, SchedulerError};

/// How the populator loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulatorOptions {
    pub tick_interval: Duration,
    /// Move every active schedule's cursor to the start time before the
    /// first tick, so downtime is not backfilled.
    pub fast_forward_on_startup: bool,
    /// Run exactly one tick and return.
    pub one_shot: bool,
}

impl Default for PopulatorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            fast_forward_on_startup: true,
            one_shot: false,
        }
    }
}

impl From<&PopulatorConfig> for PopulatorOptions {
    fn from(config: &PopulatorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            fast_forward_on_startup: config.fast_forward_on_startup,
            one_shot: false,
        }
    }
}

/// What one populator tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationReport {
    /// Active schedules examined.
    pub schedules: usize,
    /// Tasks created across all schedules.
    pub created: usize,
    /// Schedules switched off because a limit was reached.
    pub deactivated: usize,
    /// Schedules left untouched because of a per-schedule error.
    pub skipped: usize,
}

struct Populated {
    created: usize,
    deactivated: bool,
}

/// Expands active cron schedules into open tasks.
pub struct PeriodicPopulator<S> {
    store: Arc<S>,
}

impl<S: TaskStore + PeriodicTaskStore + 'static> PeriodicPopulator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Materialise every occurrence in `(last_population, now]` for every
    /// active schedule.
    ///
    /// A schedule with an unusable cron expression, or one the store rejects,
    /// is logged and skipped. Connectivity failures abort the whole tick and
    /// leave the failing schedule's cursor where it was.
    ///
    /// Only the cursor and activity flag are written back, and only if the
    /// schedule is still active, so operator edits made meanwhile survive.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<PopulationReport> {
        let mut report = PopulationReport::default();

        for mut schedule in self.store.active_periodic()? {
            report.schedules += 1;
            match self.populate(&mut schedule, now) {
                Ok(populated) => {
                    report.created += populated.created;
                    report.deactivated += usize::from(populated.deactivated);
                }
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => {
                    warn!(schedule_id = %schedule.id, "schedule skipped: {e}");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    fn populate(&self, schedule: &mut PeriodicTask, now: DateTime<Utc>) -> Result<Populated> {
        let cron = CronExpression::parse(&schedule.cron_expression)?;
        let mut children = self.store.count_children(&schedule.id)?;
        let mut populated = Populated {
            created: 0,
            deactivated: false,
        };

        for occurrence in cron.occurrences_in_range(schedule.last_population, now) {
            if let Some(limit) = schedule.limit_for(occurrence, children) {
                info!(schedule_id = %schedule.id, %limit, "schedule deactivated");
                schedule.is_active = false;
                populated.deactivated = true;
                break;
            }

            let task = schedule.materialize(occurrence);
            match self.store.create_task(&task) {
                Ok(()) => {
                    debug!(schedule_id = %schedule.id, task_id = %task.id, "task materialised");
                    populated.created += 1;
                    children += 1;
                }
                Err(StoreError::DuplicateId { id }) => {
                    debug!(schedule_id = %schedule.id, task_id = %id, "occurrence already materialised");
                }
                Err(e) => return Err(e.into()),
            }
        }

        schedule.last_population = schedule.last_population.max(now);
        if !self
            .store
            .record_population(&schedule.id, schedule.last_population, schedule.is_active)?
        {
            info!(schedule_id = %schedule.id, "schedule deactivated during population; cursor not written");
        }
        Ok(populated)
    }

    /// Move every active schedule's cursor forward to `now`.
    ///
    /// Returns the number of schedules moved.
    pub fn fast_forward(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut moved = 0;
        for schedule in self.store.active_periodic()? {
            if schedule.last_population >= now {
                continue;
            }
            debug!(
                schedule_id = %schedule.id,
                from = %schedule.last_population,
                "fast-forwarding schedule cursor"
            );
            if self.store.record_population(&schedule.id, now, true)? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Main loop. Ticks every `tick_interval` until `cancel` fires, or once in
    /// one-shot mode.
    pub async fn run(self: Arc<Self>, options: PopulatorOptions, cancel: CancellationToken) {
        info!(
            interval_ms = options.tick_interval.as_millis() as u64,
            one_shot = options.one_shot,
            "periodic populator started"
        );

        if options.fast_forward_on_startup {
            let worker = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || worker.fast_forward(Utc::now()))
                .await
                .map_err(SchedulerError::from)
                .and_then(|r| r)
            {
                Ok(0) => {}
                Ok(count) => info!(count, "schedule cursors fast-forwarded on startup"),
                Err(e) => error!("startup fast-forward failed: {e}"),
            }
        }

        if options.one_shot {
            Arc::clone(&self).run_tick().await;
        } else {
            let mut interval = tokio::time::interval(options.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => Arc::clone(&self).run_tick().await,
                }
            }
        }

        info!("periodic populator stopped");
    }

    async fn run_tick(self: Arc<Self>) {
        let worker = Arc::clone(&self);
        let joined = tokio::task::spawn_blocking(move || worker.tick(Utc::now())).await;

        match joined.map_err(SchedulerError::from).and_then(|r| r) {
            Ok(report) if report.created > 0 || report.deactivated > 0 || report.skipped > 0 => info!(
                schedules = report.schedules,
                created = report.created,
                deactivated = report.deactivated,
                skipped = report.skipped,
                "populator tick complete"
            ),
            Ok(report) => debug!(schedules = report.schedules, "populator tick: nothing to create"),
            Err(e) => {
                error!("periodic populator tick failed: {e}");
                if e.is_connectivity() {
                    if let Err(e) = self.store.reconnect() {
                        error!("schedule store reconnect failed: {e}");
                    }
                }
            }
        }
    }
}
