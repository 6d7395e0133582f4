use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tempo_core::schedule::compute_next_run;
use tempo_core::timezone::parse_tz;
use tempo_core::{ExecutionId, JobDefinition, JobExecutionResult, JobId, JobStatus};
use tracing::{info, instrument};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// Execution history.
///
/// `save_result` is an upsert; the engine calls it whenever an execution
/// reaches a terminal status.
pub trait ExecutionStore: Send + Sync {
    fn save_result(&self, result: &JobExecutionResult) -> Result<()>;
    fn load_result(&self, execution_id: &ExecutionId) -> Result<Option<JobExecutionResult>>;
    /// Newest first.
    fn recent(&self, job_id: &JobId, limit: usize) -> Result<Vec<JobExecutionResult>>;
}

/// Process-local history, used when no database is configured.
#[derive(Default)]
pub struct MemoryExecutionStore {
    results: Mutex<HashMap<ExecutionId, JobExecutionResult>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn save_result(&self, result: &JobExecutionResult) -> Result<()> {
        self.results
            .lock()
            .unwrap()
            .insert(result.execution_id.clone(), result.clone());
        Ok(())
    }

    fn load_result(&self, execution_id: &ExecutionId) -> Result<Option<JobExecutionResult>> {
        Ok(self.results.lock().unwrap().get(execution_id).cloned())
    }

    fn recent(&self, job_id: &JobId, limit: usize) -> Result<Vec<JobExecutionResult>> {
        let mut hits: Vec<JobExecutionResult> = self
            .results
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.job_id == *job_id)
            .cloned()
            .collect();
        // Execution ids are UUIDv7, so they sort by creation time.
        hits.sort_by(|a, b| b.execution_id.cmp(&a.execution_id));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// SQLite-backed execution history.
pub struct SqliteExecutionStore {
    db: Mutex<Connection>,
}

impl SqliteExecutionStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

const SELECT_EXECUTION: &str = "SELECT execution_id, job_id, job_name, timezone, status, start_time,
        end_time, duration_ms, retry_count, error_message, executed_on_agent,
        assignment_id, steps
     FROM executions";

impl ExecutionStore for SqliteExecutionStore {
    #[instrument(skip(self, r), fields(execution_id = %r.execution_id, status = %r.status))]
    fn save_result(&self, r: &JobExecutionResult) -> Result<()> {
        let db = self.db.lock().unwrap();
        let steps = serde_json::to_string(&r.steps)?;
        db.execute(
            "INSERT INTO executions
             (execution_id, job_id, job_name, timezone, status, start_time, end_time,
              duration_ms, retry_count, error_message, executed_on_agent, assignment_id,
              steps, recorded_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(execution_id) DO UPDATE SET
               status = excluded.status,
               start_time = excluded.start_time,
               end_time = excluded.end_time,
               duration_ms = excluded.duration_ms,
               retry_count = excluded.retry_count,
               error_message = excluded.error_message,
               executed_on_agent = excluded.executed_on_agent,
               assignment_id = excluded.assignment_id,
               steps = excluded.steps",
            params![
                r.execution_id.as_str(),
                r.job_id.as_str(),
                r.job_name,
                r.timezone,
                r.status.to_string(),
                r.start_time.map(ts),
                r.end_time.map(ts),
                r.duration_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
                r.retry_count,
                r.error_message,
                r.executed_on_agent.as_ref().map(|a| a.as_str()),
                r.assignment_id.as_ref().map(|a| a.as_str()),
                steps,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn load_result(&self, execution_id: &ExecutionId) -> Result<Option<JobExecutionResult>> {
        let db = self.db.lock().unwrap();
        let raw = db
            .query_row(
                &format!("{SELECT_EXECUTION} WHERE execution_id = ?1"),
                [execution_id.as_str()],
                read_execution_row,
            )
            .optional()?;
        raw.map(row_to_result).transpose()
    }

    fn recent(&self, job_id: &JobId, limit: usize) -> Result<Vec<JobExecutionResult>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT_EXECUTION} WHERE job_id = ?1 ORDER BY recorded_at DESC, execution_id DESC LIMIT ?2"
        ))?;
        let rows: Vec<ExecutionRow> = stmt
            .query_map(
                params![job_id.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
                read_execution_row,
            )?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(row_to_result).collect()
    }
}

// ── Recurring job definitions ─────────────────────────────────────────────

/// A job definition with a schedule, plus its firing bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub job: JobDefinition,
    /// `None` once the schedule is exhausted.
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite persistence for recurring job definitions.
pub struct JobStore {
    db: Mutex<Connection>,
}

impl JobStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Store `job` and compute its first run after `now` in the job's timezone.
    #[instrument(skip(self, job), fields(name = %job.name))]
    pub fn add(&self, job: JobDefinition, now: DateTime<Utc>) -> Result<RecurringJob> {
        let errors = job.validate();
        if !errors.is_empty() {
            return Err(StoreError::InvalidJob(errors.join("; ")));
        }
        let schedule = job
            .schedule
            .as_ref()
            .ok_or_else(|| StoreError::InvalidJob("recurring job needs a schedule".to_string()))?;
        let tz = parse_tz(&job.timezone).map_err(|e| StoreError::InvalidJob(e.to_string()))?;
        let next_run = compute_next_run(schedule, tz, now);
        let definition = serde_json::to_string(&job)?;

        self.db.lock().unwrap().execute(
            "INSERT INTO recurring_jobs
             (id, name, definition, next_run, last_run, run_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,NULL,0,?5,?5)",
            params![job.id.as_str(), job.name, definition, next_run.map(ts), ts(now)],
        )?;
        info!(job_id = %job.id, next_run = ?next_run, "recurring job added");

        Ok(RecurringJob {
            job,
            next_run,
            last_run: None,
            run_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Remove a job by ID. Returns `JobNotFound` if no row is deleted.
    pub fn remove(&self, id: &JobId) -> Result<()> {
        let n = self
            .db
            .lock()
            .unwrap()
            .execute("DELETE FROM recurring_jobs WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(StoreError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "recurring job removed");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<RecurringJob>> {
        self.query("ORDER BY created_at", params![])
    }

    /// Jobs whose next run is at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        self.query(
            "WHERE next_run IS NOT NULL AND next_run <= ?1 ORDER BY next_run",
            params![ts(now)],
        )
    }

    /// Record a firing and move the job to `next_run`.
    pub fn mark_fired(
        &self,
        id: &JobId,
        fired_at: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.db.lock().unwrap().execute(
            "UPDATE recurring_jobs SET next_run = ?1, last_run = ?2,
               run_count = run_count + 1, updated_at = ?2
             WHERE id = ?3",
            params![next_run.map(ts), ts(fired_at), id.as_str()],
        )?;
        Ok(())
    }

    // ---- private helpers ----

    fn query(&self, tail: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RecurringJob>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT definition, next_run, last_run, run_count, created_at, updated_at
             FROM recurring_jobs {tail}"
        ))?;
        let rows: Vec<(String, Option<String>, Option<String>, u32, String, String)> = stmt
            .query_map(args, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(definition, next_run, last_run, run_count, created_at, updated_at)| {
                Ok(RecurringJob {
                    job: serde_json::from_str(&definition)?,
                    next_run: parse_opt_ts(next_run)?,
                    last_run: parse_opt_ts(last_run)?,
                    run_count,
                    created_at: parse_ts(&created_at)?,
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .collect()
    }
}

// ---- row mapping ----

type ExecutionRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    u32,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn read_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok((
        row.get(0)?,  // execution_id
        row.get(1)?,  // job_id
        row.get(2)?,  // job_name
        row.get(3)?,  // timezone
        row.get(4)?,  // status
        row.get(5)?,  // start_time
        row.get(6)?,  // end_time
        row.get(7)?,  // duration_ms
        row.get(8)?,  // retry_count
        row.get(9)?,  // error_message
        row.get(10)?, // executed_on_agent
        row.get(11)?, // assignment_id
        row.get(12)?, // steps JSON
    ))
}

fn row_to_result(row: ExecutionRow) -> Result<JobExecutionResult> {
    let (
        execution_id,
        job_id,
        job_name,
        timezone,
        status,
        start_time,
        end_time,
        duration_ms,
        retry_count,
        error_message,
        executed_on_agent,
        assignment_id,
        steps,
    ) = row;
    let status: JobStatus = status.parse().map_err(conversion_error)?;

    Ok(JobExecutionResult {
        execution_id: execution_id.into(),
        job_id: job_id.into(),
        job_name,
        timezone,
        status,
        start_time: parse_opt_ts(start_time)?,
        end_time: parse_opt_ts(end_time)?,
        duration_ms: duration_ms.map(|ms| u64::try_from(ms).unwrap_or(0)),
        steps: serde_json::from_str(&steps)?,
        retry_count,
        error_message,
        executed_on_agent: executed_on_agent.map(Into::into),
        assignment_id: assignment_id.map(Into::into),
    })
}

/// Fixed-width UTC timestamps so `next_run <= ?` compares correctly as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(e.to_string()))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn conversion_error(msg: String) -> StoreError {
    StoreError::Database(rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        msg.into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempo_core::{Schedule, StepConfig, StepExecutionResult, StepStatus};

    fn job() -> JobDefinition {
        JobDefinition::new(
            "nightly",
            "Europe/Berlin",
            vec![StepConfig::new("a", "echo", json!({"message": "hi"}))],
        )
    }

    fn finished(job: &JobDefinition) -> JobExecutionResult {
        let mut r = JobExecutionResult::new(ExecutionId::new(), job);
        r.start().unwrap();
        r.push_step(StepExecutionResult::new("a", 1, StepStatus::Success).with_output(json!({"message": "hi"})));
        r.finish(JobStatus::Success, None).unwrap();
        r
    }

    fn sqlite() -> SqliteExecutionStore {
        SqliteExecutionStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn execution_roundtrips_through_sqlite() {
        let store = sqlite();
        let r = finished(&job());
        store.save_result(&r).unwrap();

        let loaded = store.load_result(&r.execution_id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Success);
        assert_eq!(loaded.steps, r.steps);
        assert_eq!(loaded.duration_ms, r.duration_ms);
        assert!(store.load_result(&ExecutionId::new()).unwrap().is_none());
    }

    #[test]
    fn save_is_an_upsert() {
        let store = sqlite();
        let j = job();
        let mut r = JobExecutionResult::new(ExecutionId::new(), &j);
        store.save_result(&r).unwrap();
        r.start().unwrap();
        r.finish(JobStatus::Failed, Some("boom".into())).unwrap();
        store.save_result(&r).unwrap();

        let loaded = store.load_result(&r.execution_id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        for store in [
            Box::new(sqlite()) as Box<dyn ExecutionStore>,
            Box::new(MemoryExecutionStore::new()),
        ] {
            let j = job();
            let ids: Vec<ExecutionId> = (0..3)
                .map(|_| {
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    let r = finished(&j);
                    store.save_result(&r).unwrap();
                    r.execution_id
                })
                .collect();
            store.save_result(&finished(&job())).unwrap();

            let recent = store.recent(&j.id, 2).unwrap();
            assert_eq!(recent.len(), 2);
            assert_eq!(recent[0].execution_id, ids[2]);
            assert_eq!(recent[1].execution_id, ids[1]);
        }
    }

    #[test]
    fn recurring_jobs_come_due_and_advance() {
        let store = JobStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let now = Utc::now();
        let mut j = job();
        j.schedule = Some(Schedule::Interval { every_secs: 60 });
        let added = store.add(j.clone(), now).unwrap();
        assert_eq!(added.next_run, Some(now + Duration::seconds(60)));

        assert!(store.due(now).unwrap().is_empty());
        let due = store.due(now + Duration::seconds(61)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job, j);

        let fired = now + Duration::seconds(61);
        store.mark_fired(&j.id, fired, Some(fired + Duration::seconds(60))).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed[0].run_count, 1);
        assert!(store.due(fired).unwrap().is_empty());

        store.remove(&j.id).unwrap();
        assert!(matches!(store.remove(&j.id), Err(StoreError::JobNotFound { .. })));
    }

    #[test]
    fn recurring_job_without_schedule_is_rejected() {
        let store = JobStore::new(Connection::open_in_memory().unwrap()).unwrap();
        assert!(matches!(store.add(job(), Utc::now()), Err(StoreError::InvalidJob(_))));
    }

    #[test]
    fn unrepresentable_interval_is_rejected() {
        let store = JobStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let mut job = job();
        job.schedule = Some(Schedule::Interval {
            every_secs: 10_000_000_000_000_000,
        });
        let err = store.add(job, Utc::now()).unwrap_err();
        assert!(matches!(&err, StoreError::InvalidJob(msg) if msg.contains("too large")));
        assert!(store.list().unwrap().is_empty());
    }
}
