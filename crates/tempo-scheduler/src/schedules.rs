use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempo_core::{ActivationChange, PeriodicTask};
use tempo_store::{PeriodicTaskStore, StoreError};
use tracing::info;

use crate::crontab::CronExpression;
use crate::error::Result;

/// The instant the populator would materialise next for `schedule`, given the
/// number of tasks it already owns.
///
/// `None` when the schedule is inactive, its cron expression cannot be
/// evaluated, or a limit forbids the next occurrence.
pub fn next_planned_execution(schedule: &PeriodicTask, children: u64) -> Option<DateTime<Utc>> {
    if !schedule.is_active {
        return None;
    }
    let cron = CronExpression::parse(&schedule.cron_expression).ok()?;
    cron.next_occurrence(schedule.last_population)
        .filter(|next| schedule.limit_for(*next, children).is_none())
}

/// Operator-facing administration of periodic schedules.
///
/// Every write validates the schedule (including evaluating the cron
/// expression) before it reaches the store.
pub struct ScheduleService<S> {
    store: Arc<S>,
}

impl<S: PeriodicTaskStore> ScheduleService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, id: &str) -> Result<Option<PeriodicTask>> {
        Ok(self.store.get_periodic(id)?)
    }

    pub fn create(&self, schedule: PeriodicTask) -> Result<PeriodicTask> {
        CronExpression::parse(&schedule.cron_expression)?;
        self.store.create_periodic(&schedule)?;
        info!(
            schedule_id = %schedule.id,
            cron = %schedule.cron_expression,
            task_type = %schedule.task_type,
            "schedule created"
        );
        Ok(schedule)
    }

    /// Overwrite a stored schedule, deriving the activation change from the
    /// stored record.
    ///
    /// The cursor never moves backwards, so a stale copy cannot cause
    /// re-population of a range already covered.
    pub fn update(&self, mut schedule: PeriodicTask, now: DateTime<Utc>) -> Result<PeriodicTask> {
        let stored = self.require(&schedule.id)?;
        let change = ActivationChange::new(stored.is_active, schedule.is_active);
        schedule.last_population = schedule.last_population.max(stored.last_population);
        self.save(schedule, change, now)
    }

    /// Persist `schedule` with an explicit activation change.
    ///
    /// A false-to-true change resets `last_population` to `now`; occurrences
    /// missed while inactive are never backfilled.
    pub fn save(
        &self,
        mut schedule: PeriodicTask,
        change: ActivationChange,
        now: DateTime<Utc>,
    ) -> Result<PeriodicTask> {
        CronExpression::parse(&schedule.cron_expression)?;
        schedule.apply_activation(change, now);
        self.store.update_periodic(&schedule)?;

        if change.is_reactivation() {
            info!(schedule_id = %schedule.id, cursor = %schedule.last_population, "schedule reactivated");
        } else if change.is_deactivation() {
            info!(schedule_id = %schedule.id, "schedule deactivated");
        }
        Ok(schedule)
    }

    pub fn set_active(&self, id: &str, active: bool, now: DateTime<Utc>) -> Result<PeriodicTask> {
        let stored = self.require(id)?;
        let change = ActivationChange::new(stored.is_active, active);
        self.save(stored, change, now)
    }

    /// Preview of the next occurrence the populator would create.
    pub fn next_planned_execution(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let schedule = self.require(id)?;
        let children = self.store.count_children(id)?;
        Ok(next_planned_execution(&schedule, children))
    }

    fn require(&self, id: &str) -> Result<PeriodicTask> {
        self.store.get_periodic(id)?.ok_or_else(|| {
            StoreError::NotFound { id: id.to_string() }.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerError;
    use chrono::TimeZone;
    use serde_json::json;
    use tempo_core::{Task, ValidationError};
    use tempo_store::{SqliteStore, TaskStore};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn service() -> (Arc<SqliteStore>, ScheduleService<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (Arc::clone(&store), ScheduleService::new(store))
    }

    #[test]
    fn create_rejects_cron_the_evaluator_cannot_run() {
        let (store, svc) = service();
        let err = svc
            .create(PeriodicTask::new("p", "noop", "99 * * * *", at(8, 0)))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(ValidationError::InvalidCron { .. })));
        assert!(store.get_periodic("p").unwrap().is_none());
    }

    #[test]
    fn create_rejects_both_limits_before_write() {
        let (store, svc) = service();
        let schedule = PeriodicTask::new("p", "noop", "42 * * * *", at(8, 0))
            .with_max_executions(3)
            .with_end_time(at(12, 0));
        assert!(svc.create(schedule).is_err());
        assert!(store.get_periodic("p").unwrap().is_none());
    }

    #[test]
    fn reactivation_resets_cursor_to_now() {
        let (_, svc) = service();
        svc.create(PeriodicTask::new("p", "noop", "42 * * * *", at(8, 0))).unwrap();

        let off = svc.set_active("p", false, at(9, 0)).unwrap();
        assert!(!off.is_active);
        assert_eq!(off.last_population, at(8, 0));

        let on = svc.set_active("p", true, at(11, 0)).unwrap();
        assert!(on.is_active);
        assert_eq!(on.last_population, at(11, 0));
        assert_eq!(svc.get("p").unwrap().unwrap().last_population, at(11, 0));
    }

    #[test]
    fn update_derives_activation_and_never_rewinds_cursor() {
        let (_, svc) = service();
        let created = svc.create(PeriodicTask::new("p", "noop", "42 * * * *", at(10, 0))).unwrap();

        let mut stale = created.clone();
        stale.last_population = at(6, 0);
        stale.payload_template = json!({"v": 2});
        let saved = svc.update(stale, at(10, 30)).unwrap();
        assert_eq!(saved.last_population, at(10, 0));
        assert_eq!(saved.payload_template["v"], 2);

        let mut off = saved.clone();
        off.is_active = false;
        svc.update(off, at(10, 40)).unwrap();
        let mut on = svc.get("p").unwrap().unwrap();
        on.is_active = true;
        assert_eq!(svc.update(on, at(12, 0)).unwrap().last_population, at(12, 0));
    }

    #[test]
    fn unknown_schedule_is_not_found() {
        let (_, svc) = service();
        let err = svc.set_active("ghost", true, at(9, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn preview_honours_activity_and_limits() {
        let schedule = PeriodicTask::new("p", "noop", "42 * * * *", at(8, 0));
        assert_eq!(next_planned_execution(&schedule, 0), Some(at(8, 42)));

        let mut inactive = schedule.clone();
        inactive.is_active = false;
        assert_eq!(next_planned_execution(&inactive, 0), None);

        let capped = schedule.clone().with_max_executions(1);
        assert_eq!(next_planned_execution(&capped, 0), Some(at(8, 42)));
        assert_eq!(next_planned_execution(&capped, 1), None);

        let ending = schedule.clone().with_end_time(at(8, 30));
        assert_eq!(next_planned_execution(&ending, 0), None);
    }

    #[test]
    fn service_preview_counts_existing_children() {
        let (store, svc) = service();
        let schedule = svc
            .create(PeriodicTask::new("p", "noop", "42 * * * *", at(8, 0)).with_max_executions(1))
            .unwrap();
        assert_eq!(svc.next_planned_execution("p").unwrap(), Some(at(8, 42)));

        let child: Task = schedule.materialize(at(7, 42));
        store.create_task(&child).unwrap();
        assert_eq!(svc.next_planned_execution("p").unwrap(), None);
    }
}
