use chrono::{DateTime, Utc};
use tempo_core::{PeriodicTask, Task, TaskStatus};

use crate::error::Result;

/// Recovery hook for the polling loops: drop the current connection and open
/// a fresh one after an infrastructure failure.
pub trait Reconnect {
    fn reconnect(&self) -> Result<()>;
}

/// Persistent collection of [`Task`]s.
///
/// Every write touches exactly one record; there are no multi-record
/// transactions.
pub trait TaskStore: Reconnect + Send + Sync {
    /// Insert a new task. Fails with `DuplicateId` if the id already exists.
    fn create_task(&self, task: &Task) -> Result<()>;

    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Open tasks with `eta <= now`, oldest eta first, ties in creation order.
    fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Persist `task`'s status, result and duration, but only if the stored
    /// record is still in `expected` status.
    ///
    /// Returns `false` when the record had already moved on (for instance it
    /// was marked interrupted while a handler ran). `eta` is never written.
    fn save_transition(&self, task: &Task, expected: TaskStatus) -> Result<bool>;
}

/// Persistent collection of [`PeriodicTask`] schedules.
pub trait PeriodicTaskStore: Reconnect + Send + Sync {
    /// Validate and insert. Fails with `Validation` before any write, or with
    /// `DuplicateId`.
    fn create_periodic(&self, schedule: &PeriodicTask) -> Result<()>;

    fn get_periodic(&self, id: &str) -> Result<Option<PeriodicTask>>;

    /// All schedules with `is_active = true`, in id order.
    fn active_periodic(&self) -> Result<Vec<PeriodicTask>>;

    /// Validate and overwrite an existing schedule.
    fn update_periodic(&self, schedule: &PeriodicTask) -> Result<()>;

    /// Write only the population cursor and activity flag, and only while the
    /// stored schedule is still active.
    ///
    /// Returns `false` when the schedule was deactivated or removed since it
    /// was read; other fields are never touched.
    fn record_population(
        &self,
        id: &str,
        last_population: DateTime<Utc>,
        is_active: bool,
    ) -> Result<bool>;

    /// Number of tasks whose `periodic_parent` is `periodic_id`.
    fn count_children(&self, periodic_id: &str) -> Result<u64>;
}
