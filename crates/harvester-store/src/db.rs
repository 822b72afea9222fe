use rusqlite::Connection;

use crate::error::Result;

/// Initialise the store schema in `conn`.
///
/// Creates `task_executions` and `triggers` (idempotent). Execution history is
/// queried by task, status and start time, so those columns are indexed.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task_executions (
            id              TEXT    NOT NULL PRIMARY KEY,
            task_name       TEXT    NOT NULL,
            trigger_source  TEXT    NOT NULL,   -- cron | manual | api | event
            trigger_name    TEXT,
            params          TEXT    NOT NULL,   -- JSON
            status          TEXT    NOT NULL,   -- running | success | failed | cancelled
            result          TEXT,               -- JSON or NULL
            error           TEXT,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            max_retries     INTEGER NOT NULL DEFAULT 0,
            started_at      TEXT    NOT NULL,   -- RFC 3339, millisecond precision
            finished_at     TEXT,
            duration_ms     INTEGER
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_task_executions_task ON task_executions (task_name);
        CREATE INDEX IF NOT EXISTS idx_task_executions_status ON task_executions (status);
        CREATE INDEX IF NOT EXISTS idx_task_executions_started ON task_executions (started_at);

        CREATE TABLE IF NOT EXISTS triggers (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            task_name   TEXT    NOT NULL,
            cron        TEXT    NOT NULL,
            params      TEXT    NOT NULL,   -- JSON object
            enabled     INTEGER NOT NULL DEFAULT 1,
            description TEXT,
            overlap     TEXT    NOT NULL DEFAULT 'allow',
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
