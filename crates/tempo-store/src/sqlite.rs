use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tempo_core::{PeriodicTask, Task, TaskStatus};
use tracing::{debug, info, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::store::{PeriodicTaskStore, Reconnect, TaskStore};

const TASK_COLUMNS: &str = "id, eta, task_type, payload, status, result,
    execution_duration, periodic_parent, created_at, updated_at";

const PERIODIC_COLUMNS: &str = "id, task_type, payload_template, cron_expression,
    is_active, max_number_of_executions, end_time, last_population,
    created_at, updated_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`TaskStore`] and [`PeriodicTaskStore`].
///
/// Wraps a single connection in a `Mutex`; each trait method holds the lock
/// for one statement only, so a processor and a populator can share one
/// store (or use separate stores on the same file).
pub struct SqliteStore {
    /// `None` for in-memory databases, which cannot be reopened.
    path: Option<PathBuf>,
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and initialise the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        info!(path = %path.display(), "task store opened");
        Ok(Self {
            path: Some(path),
            db: Mutex::new(conn),
        })
    }

    /// A private in-memory database. Used by tests and one-off tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            path: None,
            db: Mutex::new(conn),
        })
    }

    /// All tasks materialised by `periodic_id`, oldest eta first.
    #[instrument(skip(self))]
    pub fn tasks_for_parent(&self, periodic_id: &str) -> Result<Vec<Task>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE periodic_parent = ?1
             ORDER BY eta, seq"
        ))?;
        let rows = stmt.query_map([periodic_id], row_to_task)?;
        Ok(collect_rows(rows))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave the connection itself
        // in a torn state, so keep using it.
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

impl Reconnect for SqliteStore {
    fn reconnect(&self) -> Result<()> {
        let Some(path) = &self.path else {
            debug!("in-memory store cannot be reopened; keeping connection");
            return Ok(());
        };
        let fresh = open_connection(path)?;
        *self.conn() = fresh;
        info!(path = %path.display(), "database connection reset");
        Ok(())
    }
}

impl TaskStore for SqliteStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    fn create_task(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_string(&task.payload)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let db = self.conn();
        let inserted = db.execute(
            "INSERT INTO tasks
             (id, eta, task_type, payload, status, result, execution_duration,
              periodic_parent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO NOTHING",
            params![
                task.id,
                ts(task.eta),
                task.task_type,
                payload,
                task.status.as_str(),
                result,
                task.execution_duration.map(|d| d.as_secs_f64()),
                task.periodic_parent,
                ts(task.created_at),
                ts(task.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateId {
                id: task.id.clone(),
            });
        }
        debug!("task created");
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let db = self.conn();
        let task = db
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    #[instrument(skip(self))]
    fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'open' AND eta <= ?1
             ORDER BY eta, seq"
        ))?;
        let rows = stmt.query_map([ts(now)], row_to_task)?;
        Ok(collect_rows(rows))
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, to = %task.status))]
    fn save_transition(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        if !expected.can_transition_to(task.status) {
            return Err(StoreError::InvalidTransition {
                id: task.id.clone(),
                from: expected,
                to: task.status,
            });
        }
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let db = self.conn();
        let changed = db.execute(
            "UPDATE tasks
             SET status = ?1, result = ?2, execution_duration = ?3, updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                task.status.as_str(),
                result,
                task.execution_duration.map(|d| d.as_secs_f64()),
                ts(task.updated_at),
                task.id,
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }
}

impl PeriodicTaskStore for SqliteStore {
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    fn create_periodic(&self, schedule: &PeriodicTask) -> Result<()> {
        schedule.validate()?;
        let payload = serde_json::to_string(&schedule.payload_template)?;
        let db = self.conn();
        let inserted = db.execute(
            "INSERT INTO periodic_tasks
             (id, task_type, payload_template, cron_expression, is_active,
              max_number_of_executions, end_time, last_population, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO NOTHING",
            params![
                schedule.id,
                schedule.task_type,
                payload,
                schedule.cron_expression,
                schedule.is_active,
                schedule.max_number_of_executions,
                schedule.end_time.map(ts),
                ts(schedule.last_population),
                ts(schedule.created_at),
                ts(schedule.updated_at),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateId {
                id: schedule.id.clone(),
            });
        }
        info!("schedule created");
        Ok(())
    }

    fn get_periodic(&self, id: &str) -> Result<Option<PeriodicTask>> {
        let db = self.conn();
        let schedule = db
            .query_row(
                &format!("SELECT {PERIODIC_COLUMNS} FROM periodic_tasks WHERE id = ?1"),
                [id],
                row_to_periodic,
            )
            .optional()?;
        Ok(schedule)
    }

    fn active_periodic(&self) -> Result<Vec<PeriodicTask>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {PERIODIC_COLUMNS} FROM periodic_tasks
             WHERE is_active = 1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_periodic)?;
        Ok(collect_rows(rows))
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    fn update_periodic(&self, schedule: &PeriodicTask) -> Result<()> {
        schedule.validate()?;
        let payload = serde_json::to_string(&schedule.payload_template)?;
        let db = self.conn();
        let changed = db.execute(
            "UPDATE periodic_tasks
             SET task_type = ?1, payload_template = ?2, cron_expression = ?3,
                 is_active = ?4, max_number_of_executions = ?5, end_time = ?6,
                 last_population = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                schedule.task_type,
                payload,
                schedule.cron_expression,
                schedule.is_active,
                schedule.max_number_of_executions,
                schedule.end_time.map(ts),
                ts(schedule.last_population),
                ts(Utc::now()),
                schedule.id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                id: schedule.id.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn record_population(
        &self,
        id: &str,
        last_population: DateTime<Utc>,
        is_active: bool,
    ) -> Result<bool> {
        let db = self.conn();
        let changed = db.execute(
            "UPDATE periodic_tasks
             SET last_population = ?1, is_active = ?2, updated_at = ?3
             WHERE id = ?4 AND is_active = 1",
            params![ts(last_population), is_active, ts(Utc::now()), id],
        )?;
        Ok(changed == 1)
    }

    fn count_children(&self, periodic_id: &str) -> Result<u64> {
        let db = self.conn();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM tasks WHERE periodic_parent = ?1",
            [periodic_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

// --- row mapping -------------------------------------------------------------

/// Fixed-width UTC timestamp; lexical order equals chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => get_ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn get_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn get_opt_json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => get_json(row, idx).map(Some),
        None => Ok(None),
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        eta: get_ts(row, 1)?,
        task_type: row.get(2)?,
        payload: get_json(row, 3)?,
        status: status.parse().map_err(|e: String| conversion_error(4, e))?,
        result: get_opt_json(row, 5)?,
        execution_duration: row
            .get::<_, Option<f64>>(6)?
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        periodic_parent: row.get(7)?,
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

fn row_to_periodic(row: &Row<'_>) -> rusqlite::Result<PeriodicTask> {
    Ok(PeriodicTask {
        id: row.get(0)?,
        task_type: row.get(1)?,
        payload_template: get_json(row, 2)?,
        cron_expression: row.get(3)?,
        is_active: row.get(4)?,
        max_number_of_executions: row.get(5)?,
        end_time: get_opt_ts(row, 6)?,
        last_population: get_ts(row, 7)?,
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

/// Keep readable rows; a corrupt row is logged and skipped so it cannot wedge
/// every subsequent tick.
fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Vec<T> {
    rows.filter_map(|r| match r {
        Ok(item) => Some(item),
        Err(e) => {
            warn!("skipping unreadable row: {e}");
            None
        }
    })
    .collect()
}
