use rusqlite::Connection;

use crate::error::Result;

/// Initialise the agent registry schema in `conn`.
///
/// Creates the `agents`, `agent_pools` and `agent_assignments` tables
/// (idempotent) and seeds the `default` pool.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS agent_pools (
            name        TEXT    NOT NULL PRIMARY KEY,
            description TEXT,
            max_agents  INTEGER,            -- NULL means unbounded
            strategy    TEXT    NOT NULL DEFAULT 'least_loaded'
        ) STRICT;

        INSERT OR IGNORE INTO agent_pools (name, description, strategy)
        VALUES ('default', 'Default agent pool', 'least_loaded');

        CREATE TABLE IF NOT EXISTS agents (
            agent_id            TEXT    NOT NULL PRIMARY KEY,
            agent_name          TEXT    NOT NULL,
            hostname            TEXT    NOT NULL,
            ip_address          TEXT    NOT NULL,
            pool                TEXT    NOT NULL DEFAULT 'default',
            capabilities        TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            max_parallel_jobs   INTEGER NOT NULL DEFAULT 1,
            status              TEXT    NOT NULL DEFAULT 'offline',
            last_heartbeat      TEXT,
            current_jobs        INTEGER NOT NULL DEFAULT 0,
            is_approved         INTEGER NOT NULL DEFAULT 0,
            is_active           INTEGER NOT NULL DEFAULT 1,
            cpu_percent         REAL,
            memory_percent      REAL,
            disk_percent        REAL,
            registered_at       TEXT    NOT NULL,
            last_job_completed  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_agents_pool ON agents (pool);

        CREATE TABLE IF NOT EXISTS agent_assignments (
            assignment_id   TEXT    NOT NULL PRIMARY KEY,
            execution_id    TEXT    NOT NULL,
            agent_id        TEXT    NOT NULL,
            job_id          TEXT    NOT NULL,
            attempt         INTEGER NOT NULL,
            status          TEXT    NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 0,
            timeout_minutes INTEGER NOT NULL DEFAULT 60,
            assigned_at     TEXT    NOT NULL,
            accepted_at     TEXT,
            started_at      TEXT,
            completed_at    TEXT,
            error_message   TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_assignments_execution ON agent_assignments (execution_id);
        CREATE INDEX IF NOT EXISTS idx_assignments_agent ON agent_assignments (agent_id, status);
        ",
    )?;
    Ok(())
}
