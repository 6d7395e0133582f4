use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::{AgentId, AssignmentId, ExecutionId, JobId};

use crate::error::{AgentError, Result};

/// Liveness state of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered but no recent heartbeat.
    Offline,
    Online,
    /// Reported by the agent; alive but not taking work.
    Maintenance,
    /// Reported by the agent; alive but unhealthy.
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Offline => "offline",
            AgentStatus::Online => "online",
            AgentStatus::Maintenance => "maintenance",
            AgentStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "offline" => Ok(AgentStatus::Offline),
            "online" => Ok(AgentStatus::Online),
            "maintenance" => Ok(AgentStatus::Maintenance),
            "error" => Ok(AgentStatus::Error),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// A registered remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub agent_name: String,
    pub hostname: String,
    pub ip_address: String,
    pub pool: String,
    /// Replaced wholesale on every registration.
    pub capabilities: BTreeSet<String>,
    pub max_parallel_jobs: u32,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Jobs the agent is running, never below the number of live assignments it holds.
    pub current_jobs: u32,
    /// Administrative gate; online alone is not enough to receive work.
    pub is_approved: bool,
    /// Deactivated agents keep their record but never receive work.
    pub is_active: bool,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub registered_at: DateTime<Utc>,
    pub last_job_completed: Option<DateTime<Utc>>,
    /// Live assignments held by the dispatcher. Not persisted.
    #[serde(skip)]
    pub reserved: u32,
}

impl Agent {
    /// Heartbeat younger than `offline_after` at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, offline_after: Duration) -> bool {
        self.last_heartbeat
            .is_some_and(|hb| now.signed_duration_since(hb) <= offline_after)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_jobs < self.max_parallel_jobs
    }

    /// Could receive a new assignment right now.
    pub fn is_eligible(&self, now: DateTime<Utc>, offline_after: Duration) -> bool {
        self.is_active
            && self.is_approved
            && self.status == AgentStatus::Online
            && self.is_fresh(now, offline_after)
            && self.has_capacity()
    }

    pub fn has_capabilities<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }

    /// `current_jobs / max_parallel_jobs`, for least-loaded selection.
    pub fn load(&self) -> f64 {
        f64::from(self.current_jobs) / f64::from(self.max_parallel_jobs.max(1))
    }
}

/// How a pool picks among its eligible agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    LeastLoaded,
    RoundRobin,
    Random,
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadBalancingStrategy::LeastLoaded => "least_loaded",
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::Random => "random",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "least_loaded" => Ok(LoadBalancingStrategy::LeastLoaded),
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "random" => Ok(LoadBalancingStrategy::Random),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

/// Named group of agents sharing a selection strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Registration into a full pool is refused. `None` means unbounded.
    #[serde(default)]
    pub max_agents: Option<u32>,
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
}

impl AgentPool {
    pub fn new(name: impl Into<String>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            name: name.into(),
            description: None,
            max_agents: None,
            strategy,
        }
    }
}

/// State of one (execution, agent) binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Accepted,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl AssignmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssignmentStatus::Completed
                | AssignmentStatus::Failed
                | AssignmentStatus::Timeout
                | AssignmentStatus::Cancelled
        )
    }

    /// Forward-only: assigned → accepted → running → terminal, with early exits
    /// to a terminal state from any live one. An agent must accept before it runs.
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        match self {
            Assigned => matches!(next, Accepted | Timeout | Cancelled | Failed),
            Accepted => matches!(next, Running | Completed | Failed | Timeout | Cancelled),
            Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Accepted => "accepted",
            AssignmentStatus::Running => "running",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Timeout => "timeout",
            AssignmentStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "accepted" => Ok(AssignmentStatus::Accepted),
            "running" => Ok(AssignmentStatus::Running),
            "completed" => Ok(AssignmentStatus::Completed),
            "failed" => Ok(AssignmentStatus::Failed),
            "timeout" => Ok(AssignmentStatus::Timeout),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            other => Err(format!("unknown assignment status: {other}")),
        }
    }
}

/// Record binding an execution attempt to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJobAssignment {
    pub assignment_id: AssignmentId,
    pub execution_id: ExecutionId,
    pub agent_id: AgentId,
    pub job_id: JobId,
    /// 1-based dispatch attempt for this execution.
    pub attempt: u32,
    pub status: AssignmentStatus,
    pub priority: i32,
    pub timeout_minutes: u64,
    pub assigned_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl AgentJobAssignment {
    /// Apply a forward transition, stamping the matching timestamp.
    ///
    /// Each stamp is strictly later than the previous one even if the wall
    /// clock has not moved.
    pub fn transition(&mut self, next: AssignmentStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let stamp = now.max(self.last_stamp() + Duration::microseconds(1));
        match next {
            AssignmentStatus::Accepted => self.accepted_at = Some(stamp),
            AssignmentStatus::Running => self.started_at = Some(stamp),
            _ => self.completed_at = Some(stamp),
        }
        self.status = next;
        Ok(())
    }

    pub fn last_stamp(&self) -> DateTime<Utc> {
        [self.accepted_at, self.started_at, self.completed_at]
            .into_iter()
            .flatten()
            .fold(self.assigned_at, Ord::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(at: DateTime<Utc>) -> AgentJobAssignment {
        AgentJobAssignment {
            assignment_id: AssignmentId::new(),
            execution_id: ExecutionId::new(),
            agent_id: AgentId::from("a1"),
            job_id: JobId::new(),
            attempt: 1,
            status: AssignmentStatus::Assigned,
            priority: 0,
            timeout_minutes: 60,
            assigned_at: at,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    #[test]
    fn happy_path_stamps_strictly_increase_with_a_frozen_clock() {
        let now = Utc::now();
        let mut a = assignment(now);
        a.transition(AssignmentStatus::Accepted, now).unwrap();
        a.transition(AssignmentStatus::Running, now).unwrap();
        a.transition(AssignmentStatus::Completed, now).unwrap();

        let (acc, run, done) = (
            a.accepted_at.unwrap(),
            a.started_at.unwrap(),
            a.completed_at.unwrap(),
        );
        assert!(a.assigned_at < acc && acc < run && run < done);
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        use AssignmentStatus::*;
        let all = [Assigned, Accepted, Running, Completed, Failed, Timeout, Cancelled];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn running_requires_acceptance_and_nothing_goes_backwards() {
        let now = Utc::now();
        let mut a = assignment(now);
        assert!(a.transition(AssignmentStatus::Running, now).is_err());
        a.transition(AssignmentStatus::Accepted, now).unwrap();
        a.transition(AssignmentStatus::Running, now).unwrap();
        assert!(a.transition(AssignmentStatus::Accepted, now).is_err());
        assert_eq!(a.status, AssignmentStatus::Running);
    }

    #[test]
    fn eligibility_needs_approval_liveness_and_capacity() {
        let now = Utc::now();
        let mut agent = Agent {
            agent_id: AgentId::from("a1"),
            agent_name: "a1".into(),
            hostname: "h".into(),
            ip_address: "10.0.0.1".into(),
            pool: "default".into(),
            capabilities: BTreeSet::new(),
            max_parallel_jobs: 1,
            status: AgentStatus::Online,
            last_heartbeat: Some(now),
            current_jobs: 0,
            is_approved: false,
            is_active: true,
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
            registered_at: now,
            last_job_completed: None,
            reserved: 0,
        };
        let window = Duration::seconds(90);

        assert!(!agent.is_eligible(now, window), "unapproved");
        agent.is_approved = true;
        assert!(agent.is_eligible(now, window));
        assert!(!agent.is_eligible(now + Duration::seconds(91), window), "stale heartbeat");
        agent.current_jobs = 1;
        assert!(!agent.is_eligible(now, window), "full");
    }
}
