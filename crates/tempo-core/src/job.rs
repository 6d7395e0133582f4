use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TempoError};
use crate::schedule::Schedule;
use crate::timezone::parse_tz;
use crate::types::JobId;

pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;
/// Upper bound for job and step timeouts (30 days).
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_POOL: &str = "default";

/// Where a job's steps run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// In-process, through the engine's own step registry.
    #[default]
    Local,
    /// On a remote agent selected by the dispatcher.
    Agent,
}

/// One typed unit of work inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Step-type identifier resolved by the step registry (e.g. `"command"`).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Type-specific settings, validated by the step implementation.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Per-step timeout in seconds. Falls back to the step type's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl StepConfig {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>, config: Value) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: None,
            step_type: step_type.into(),
            config: match config {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            continue_on_failure: false,
            timeout: None,
        }
    }

    pub fn continue_on_failure(mut self, yes: bool) -> Self {
        self.continue_on_failure = yes;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn display_name(&self) -> &str {
        self.step_name.as_deref().unwrap_or(&self.step_id)
    }
}

/// Immutable snapshot of a job, consumed once per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub id: JobId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// IANA identifier; selects the timezone queue and resolves local times.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub steps: Vec<StepConfig>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Seconds to wait between a failed attempt and the next one.
    #[serde(default)]
    pub retry_delay: u64,
    /// Whole-job deadline in seconds, shared by every step of one attempt.
    #[serde(default = "default_job_timeout")]
    pub timeout: u64,
    /// Higher runs first when deadlines tie.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_pool: Option<String>,
    /// Capabilities an agent must advertise to receive this job.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, timezone: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            description: None,
            timezone: timezone.into(),
            steps,
            enabled: true,
            max_retries: 0,
            retry_delay: 0,
            timeout: DEFAULT_JOB_TIMEOUT_SECS,
            priority: 0,
            schedule: None,
            execution_type: ExecutionType::Local,
            preferred_pool: None,
            required_capabilities: Vec::new(),
            tags: Vec::new(),
            metadata: Map::new(),
            created_by: None,
        }
    }

    /// Structural checks that do not need a step registry.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("job name must not be empty".to_string());
        }
        if parse_tz(&self.timezone).is_err() {
            errors.push(format!("unknown timezone '{}'", self.timezone));
        }
        if self.timeout == 0 {
            errors.push("job timeout must be greater than zero".to_string());
        } else if self.timeout > MAX_TIMEOUT_SECS {
            errors.push(format!("job timeout must not exceed {MAX_TIMEOUT_SECS}s"));
        }
        if self.steps.is_empty() {
            errors.push("job must define at least one step".to_string());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                errors.push("step_id must not be empty".to_string());
            } else if !seen.insert(step.step_id.as_str()) {
                errors.push(format!("duplicate step_id '{}'", step.step_id));
            }
            match step.timeout {
                Some(0) => errors.push(format!("step '{}' timeout must be greater than zero", step.step_id)),
                Some(t) if t > MAX_TIMEOUT_SECS => errors.push(format!(
                    "step '{}' timeout must not exceed {MAX_TIMEOUT_SECS}s",
                    step.step_id
                )),
                _ => {}
            }
        }

        if let Some(schedule) = &self.schedule {
            if let Err(e) = schedule.validate() {
                errors.push(format!("schedule: {e}"));
            }
        }

        errors
    }

    /// [`validate`](Self::validate) folded into a `Configuration` error.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TempoError::Configuration { errors })
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn pool(&self) -> &str {
        self.preferred_pool.as_deref().unwrap_or(DEFAULT_POOL)
    }
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_job_timeout() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}
fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(id: &str) -> StepConfig {
        StepConfig::new(id, "echo", json!({"message": "hi"}))
    }

    #[test]
    fn minimal_json_gets_defaults() {
        let job: JobDefinition = serde_json::from_value(json!({
            "name": "nightly",
            "steps": [{"step_id": "a", "type": "echo", "config": {"message": "x"}}]
        }))
        .unwrap();

        assert_eq!(job.timezone, "UTC");
        assert_eq!(job.timeout, 3600);
        assert!(job.enabled);
        assert_eq!(job.execution_type, ExecutionType::Local);
        assert_eq!(job.pool(), "default");
        assert!(!job.steps[0].continue_on_failure);
        assert!(job.validate().is_empty());
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut job = JobDefinition::new("", "Nowhere/Special", vec![echo("a"), echo("a")]);
        job.timeout = 0;

        let errors = job.validate();
        assert!(errors.iter().any(|e| e.contains("name")));
        assert!(errors.iter().any(|e| e.contains("unknown timezone")));
        assert!(errors.iter().any(|e| e.contains("duplicate step_id 'a'")));
        assert!(errors.iter().any(|e| e.contains("job timeout")));
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let mut job = JobDefinition::new("long", "UTC", vec![echo("a").with_timeout(u64::MAX)]);
        job.timeout = u64::MAX;

        let errors = job.validate();
        assert!(errors.iter().any(|e| e.starts_with("job timeout must not exceed")));
        assert!(errors.iter().any(|e| e.starts_with("step 'a' timeout must not exceed")));

        job.timeout = MAX_TIMEOUT_SECS;
        job.steps[0].timeout = Some(MAX_TIMEOUT_SECS);
        assert!(job.validate().is_empty());
    }

    #[test]
    fn empty_job_is_rejected() {
        let job = JobDefinition::new("empty", "UTC", vec![]);
        let err = job.ensure_valid().unwrap_err();
        assert!(matches!(err, TempoError::Configuration { .. }));
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn execution_type_wire_names() {
        assert_eq!(serde_json::to_value(ExecutionType::Agent).unwrap(), json!("agent"));
        assert_eq!(serde_json::to_value(ExecutionType::Local).unwrap(), json!("local"));
    }
}
