use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TempoError};
use crate::job::JobDefinition;
use crate::types::{AgentId, AssignmentId, ExecutionId, JobId};

/// Lifecycle of one execution.
///
/// Transitions only move forward, except `Retrying`, which loops back to
/// `Running` for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
    PartialSuccess,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success
                | JobStatus::Failed
                | JobStatus::PartialSuccess
                | JobStatus::Timeout
                | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Running | Cancelled),
            Running => next != Pending && next != Running,
            Retrying => matches!(next, Running | Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::PartialSuccess => "partial_success",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "retrying" => Ok(JobStatus::Retrying),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "partial_success" => Ok(JobStatus::PartialSuccess),
            "timeout" => Ok(JobStatus::Timeout),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of one step in one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
    Cancelled,
}

impl StepStatus {
    /// Counts against the job: the step ran and did not succeed.
    pub fn is_failure(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Timeout)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Timeout => "timeout",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "timeout" => Ok(StepStatus::Timeout),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Record of one step in one attempt. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: String,
    /// 1-based attempt number of the owning execution.
    pub attempt: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepExecutionResult {
    pub fn new(step_id: impl Into<String>, attempt: u32, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            status,
            start_time: None,
            end_time: None,
            duration_ms: None,
            output: None,
            error_message: None,
        }
    }

    pub fn skipped(step_id: impl Into<String>, attempt: u32) -> Self {
        Self::new(step_id, attempt, StepStatus::Skipped)
    }

    pub fn timed(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self.duration_ms = Some(millis_between(start, end));
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}

/// Aggregate result of one execution across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionResult {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub job_name: String,
    pub timezone: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Append-only; a retried step appears again under its new attempt number.
    #[serde(default)]
    pub steps: Vec<StepExecutionResult>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_on_agent: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<AssignmentId>,
}

impl JobExecutionResult {
    pub fn new(execution_id: ExecutionId, job: &JobDefinition) -> Self {
        Self {
            execution_id,
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            timezone: job.timezone.clone(),
            status: JobStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            steps: Vec::new(),
            retry_count: 0,
            error_message: None,
            executed_on_agent: None,
            assignment_id: None,
        }
    }

    /// 1-based number of the attempt currently running (or last run).
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TempoError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move to `Running`, stamping `start_time` on the first attempt.
    pub fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Running)?;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Mark the current attempt as failed-and-retrying and bump `retry_count`.
    pub fn begin_retry(&mut self) -> Result<()> {
        self.transition(JobStatus::Retrying)?;
        self.retry_count += 1;
        Ok(())
    }

    /// Move to a terminal status and stamp end time and duration.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) -> Result<()> {
        if !status.is_terminal() {
            return Err(TempoError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.transition(status)?;
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_ms = self.start_time.map(|start| millis_between(start, end));
        self.error_message = error;
        Ok(())
    }

    pub fn push_step(&mut self, step: StepExecutionResult) {
        self.steps.push(step);
    }

    /// Step results recorded for one attempt, in order.
    pub fn attempt_steps(&self, attempt: u32) -> impl Iterator<Item = &StepExecutionResult> {
        self.steps.iter().filter(move |s| s.attempt == attempt)
    }

    /// Successful steps in the latest attempt.
    pub fn successful_steps(&self) -> usize {
        self.attempt_steps(self.attempt())
            .filter(|s| s.status == StepStatus::Success)
            .count()
    }

    /// Failed or timed-out steps in the latest attempt.
    pub fn failed_steps(&self) -> usize {
        self.attempt_steps(self.attempt())
            .filter(|s| s.status.is_failure())
            .count()
    }
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StepConfig;
    use serde_json::json;

    fn job() -> JobDefinition {
        JobDefinition::new(
            "report",
            "UTC",
            vec![StepConfig::new("a", "echo", json!({"message": "x"}))],
        )
    }

    #[test]
    fn retry_loops_back_to_running() {
        let mut r = JobExecutionResult::new(ExecutionId::new(), &job());
        r.start().unwrap();
        r.begin_retry().unwrap();
        assert_eq!(r.status, JobStatus::Retrying);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.attempt(), 2);
        r.start().unwrap();
        r.finish(JobStatus::Success, None).unwrap();
        assert!(r.end_time.is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut r = JobExecutionResult::new(ExecutionId::new(), &job());
        r.start().unwrap();
        r.finish(JobStatus::Failed, Some("boom".into())).unwrap();

        for next in [JobStatus::Running, JobStatus::Retrying, JobStatus::Success] {
            let err = r.transition(next).unwrap_err();
            assert_eq!(err.code(), "INVALID_TRANSITION");
        }
        assert_eq!(r.status, JobStatus::Failed);
    }

    #[test]
    fn finish_requires_a_terminal_status() {
        let mut r = JobExecutionResult::new(ExecutionId::new(), &job());
        r.start().unwrap();
        assert!(r.finish(JobStatus::Retrying, None).is_err());
    }

    #[test]
    fn step_counts_only_look_at_the_latest_attempt() {
        let mut r = JobExecutionResult::new(ExecutionId::new(), &job());
        r.start().unwrap();
        r.push_step(StepExecutionResult::new("a", 1, StepStatus::Failed));
        r.begin_retry().unwrap();
        r.start().unwrap();
        r.push_step(StepExecutionResult::new("a", 2, StepStatus::Success));

        assert_eq!(r.steps.len(), 2);
        assert_eq!(r.successful_steps(), 1);
        assert_eq!(r.failed_steps(), 0);
    }

    #[test]
    fn status_strings_round_trip_through_display() {
        for s in [
            JobStatus::Pending,
            JobStatus::Retrying,
            JobStatus::PartialSuccess,
            JobStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<StepStatus>().is_err());
    }
}
