use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempo_core::schedule::compute_next_run;
use tempo_core::timezone::parse_tz;
use tempo_core::ExecutionId;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::{ExecutionEngine, ScheduleAt};
use crate::store::JobStore;

/// Fires stored recurring jobs into the engine's timezone queues.
///
/// Each due occurrence becomes one [`ExecutionEngine::schedule_job`] call at
/// its exact instant, so the queue still guarantees it never starts early.
pub struct RecurringScheduler {
    jobs: Arc<JobStore>,
    engine: Arc<ExecutionEngine>,
}

impl RecurringScheduler {
    pub fn new(jobs: Arc<JobStore>, engine: Arc<ExecutionEngine>) -> Self {
        Self { jobs, engine }
    }

    /// Enqueue every occurrence due at `now` and advance each job.
    ///
    /// Occurrences missed while the process was down collapse into one run;
    /// the next run is computed from `now`, not from the missed slot.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<ExecutionId> {
        let due = match self.jobs.due(now) {
            Ok(due) => due,
            Err(e) => {
                error!("recurring job query failed: {e}");
                return Vec::new();
            }
        };

        let mut fired = Vec::new();
        for recurring in due {
            let job = recurring.job;
            let Some(slot) = recurring.next_run else {
                continue;
            };
            let next = match (&job.schedule, parse_tz(&job.timezone)) {
                (Some(schedule), Ok(tz)) => compute_next_run(schedule, tz, now),
                _ => None,
            };

            if job.enabled {
                match self.engine.schedule_job(job.clone(), ScheduleAt::At(slot)) {
                    Ok(id) => {
                        info!(job_id = %job.id, execution_id = %id, next_run = ?next, "recurring job fired");
                        fired.push(id);
                    }
                    Err(e) => warn!(job_id = %job.id, "recurring job could not be scheduled: {e}"),
                }
            }
            if let Err(e) = self.jobs.mark_fired(&job.id, now, next) {
                error!(job_id = %job.id, "failed to advance recurring job: {e}");
            }
        }
        fired
    }

    /// Main loop. Ticks every second until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("recurring scheduler started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_at(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("recurring scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use rusqlite::Connection;
    use serde_json::json;
    use tempo_core::config::EngineConfig;
    use tempo_core::{JobDefinition, Schedule, StepConfig};

    fn setup() -> (Arc<JobStore>, RecurringScheduler) {
        let jobs = Arc::new(JobStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let engine = ExecutionEngine::builder(EngineConfig::default()).build().unwrap();
        (jobs.clone(), RecurringScheduler::new(jobs, engine))
    }

    fn recurring(schedule: Schedule) -> JobDefinition {
        let mut job = JobDefinition::new(
            "heartbeat-report",
            "America/New_York",
            vec![StepConfig::new("a", "echo", json!({"message": "tick"}))],
        );
        job.schedule = Some(schedule);
        job
    }

    #[tokio::test]
    async fn due_job_fires_once_and_advances() {
        let (jobs, scheduler) = setup();
        // Stored timestamps keep microseconds.
        let now = Utc::now().trunc_subsecs(6);
        jobs.add(recurring(Schedule::Interval { every_secs: 3600 }), now).unwrap();

        assert!(scheduler.tick_at(now).is_empty());
        let later = now + Duration::seconds(3601);
        let fired = scheduler.tick_at(later);
        assert_eq!(fired.len(), 1);
        assert!(scheduler.tick_at(later).is_empty());

        let stored = &jobs.list().unwrap()[0];
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.next_run, Some(later + Duration::seconds(3600)));
    }

    #[tokio::test]
    async fn each_occurrence_gets_its_own_execution() {
        let (jobs, scheduler) = setup();
        let now = Utc::now();
        jobs.add(recurring(Schedule::Interval { every_secs: 60 }), now).unwrap();

        let first = scheduler.tick_at(now + Duration::seconds(61));
        let second = scheduler.tick_at(now + Duration::seconds(122));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0], second[0]);
    }

    #[tokio::test]
    async fn exhausted_once_job_stops_firing() {
        let (jobs, scheduler) = setup();
        let now = Utc::now();
        let at = now + Duration::seconds(10);
        jobs.add(recurring(Schedule::Once { at }), now).unwrap();

        assert_eq!(scheduler.tick_at(at).len(), 1);
        assert!(jobs.list().unwrap()[0].next_run.is_none());
        assert!(scheduler.tick_at(at + Duration::days(1)).is_empty());
    }
}
