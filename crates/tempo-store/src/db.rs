use rusqlite::Connection;

use crate::error::Result;

/// Initialise the task and schedule schema in `conn`.
///
/// Idempotent. Timestamps are stored as fixed-width RFC 3339 UTC strings so
/// that text comparison in `WHERE eta <= ?` matches chronological order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,  -- creation order
            id                  TEXT    NOT NULL UNIQUE,
            eta                 TEXT    NOT NULL,
            task_type           TEXT    NOT NULL,
            payload             TEXT    NOT NULL DEFAULT 'null',    -- JSON
            status              TEXT    NOT NULL DEFAULT 'open'
                CHECK (status IN ('open', 'in_progress', 'done', 'error', 'interrupted')),
            result              TEXT,                               -- JSON or NULL
            execution_duration  REAL,                               -- seconds
            periodic_parent     TEXT,                               -- weak ref, no FK
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Polling: WHERE status = 'open' AND eta <= ? ORDER BY eta, seq
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, eta, seq);
        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks (periodic_parent);

        CREATE TABLE IF NOT EXISTS periodic_tasks (
            id                        TEXT    NOT NULL PRIMARY KEY,
            task_type                 TEXT    NOT NULL,
            payload_template          TEXT    NOT NULL DEFAULT 'null',
            cron_expression           TEXT    NOT NULL,
            is_active                 INTEGER NOT NULL DEFAULT 1,
            max_number_of_executions  INTEGER,
            end_time                  TEXT,
            last_population           TEXT    NOT NULL,
            created_at                TEXT    NOT NULL,
            updated_at                TEXT    NOT NULL,
            CONSTRAINT end_time_xor_max_executions
                CHECK (end_time IS NULL OR max_number_of_executions IS NULL)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_periodic_active ON periodic_tasks (is_active);
        ",
    )?;
    Ok(())
}
