use rusqlite::Connection;

use crate::error::Result;

/// Initialise the engine schema in `conn`.
///
/// `executions` holds one row per execution, rewritten on every status
/// change; `recurring_jobs` holds the definitions the scheduler loop fires.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS executions (
            execution_id      TEXT    NOT NULL PRIMARY KEY,
            job_id            TEXT    NOT NULL,
            job_name          TEXT    NOT NULL,
            timezone          TEXT    NOT NULL,
            status            TEXT    NOT NULL,
            start_time        TEXT,
            end_time          TEXT,
            duration_ms       INTEGER,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            error_message     TEXT,
            executed_on_agent TEXT,
            assignment_id     TEXT,
            steps             TEXT    NOT NULL,   -- JSON array of StepExecutionResult
            recorded_at       TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_job
            ON executions (job_id, recorded_at);

        CREATE TABLE IF NOT EXISTS recurring_jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            definition  TEXT    NOT NULL,   -- JSON-encoded JobDefinition
            next_run    TEXT,               -- RFC 3339 or NULL when exhausted
            last_run    TEXT,
            run_count   INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_recurring_next_run ON recurring_jobs (next_run);
        ",
    )?;
    Ok(())
}
