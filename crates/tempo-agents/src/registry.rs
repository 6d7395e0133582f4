use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tempo_core::{AgentId, JobDefinition, job::DEFAULT_POOL};
use tracing::{info, instrument, warn};

use crate::error::{AgentError, Result};
use crate::store::AgentStore;
use crate::types::{Agent, AgentPool, AgentStatus, LoadBalancingStrategy};

/// What an agent sends when it (re-)registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub agent_id: AgentId,
    pub agent_name: Option<String>,
    pub hostname: String,
    pub ip_address: String,
    pub capabilities: Vec<String>,
    pub max_parallel_jobs: u32,
    pub pool: Option<String>,
}

/// Whether a registration created a new agent or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Created,
    Updated,
}

/// Metrics carried by a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: Option<AgentStatus>,
    pub current_jobs: u32,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<AgentId, Agent>,
    pools: HashMap<String, AgentPool>,
    /// Round-robin position per pool.
    cursors: HashMap<String, usize>,
}

/// Single owner of agent liveness and load.
///
/// All reads and writes go through one mutex so heartbeat-derived status and
/// assignment counts never race. Changes are written through to the optional
/// [`AgentStore`]; store failures are logged, never fatal.
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    store: Option<Arc<dyn AgentStore>>,
    offline_after: Duration,
    auto_approve: bool,
}

impl AgentRegistry {
    pub fn new(offline_after: Duration) -> Self {
        let mut state = RegistryState::default();
        state.pools.insert(
            DEFAULT_POOL.to_string(),
            AgentPool::new(DEFAULT_POOL, LoadBalancingStrategy::LeastLoaded),
        );
        Self {
            state: Mutex::new(state),
            store: None,
            offline_after,
            auto_approve: false,
        }
    }

    /// Start approving new registrations without an admin step.
    pub fn with_auto_approve(mut self, yes: bool) -> Self {
        self.auto_approve = yes;
        self
    }

    /// Attach a store and load previously registered agents and pools.
    ///
    /// Loaded agents start offline with no jobs until they heartbeat again.
    pub fn with_store(mut self, store: Arc<dyn AgentStore>) -> Result<Self> {
        {
            let state = self.state.get_mut().unwrap();
            for pool in store.load_pools()? {
                state.pools.insert(pool.name.clone(), pool);
            }
            for mut agent in store.load_agents()? {
                agent.status = AgentStatus::Offline;
                agent.current_jobs = 0;
                state.agents.insert(agent.agent_id.clone(), agent);
            }
            info!(agents = state.agents.len(), pools = state.pools.len(), "agent registry restored");
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }

    /// Upsert by `agent_id`. The agent stays offline until its first heartbeat.
    #[instrument(skip(self, reg), fields(agent_id = %reg.agent_id))]
    pub fn register(&self, reg: Registration, now: DateTime<Utc>) -> Result<(Agent, RegistrationStatus)> {
        if reg.agent_id.as_str().trim().is_empty() {
            return Err(AgentError::InvalidRequest("agent_id must not be empty".to_string()));
        }
        if reg.max_parallel_jobs == 0 {
            return Err(AgentError::InvalidRequest(
                "max_parallel_jobs must be at least 1".to_string(),
            ));
        }
        let pool_name = reg.pool.clone().unwrap_or_else(|| DEFAULT_POOL.to_string());

        let mut state = self.state.lock().unwrap();
        let new_pool = !state.pools.contains_key(&pool_name);
        if new_pool {
            state.pools.insert(
                pool_name.clone(),
                AgentPool::new(pool_name.clone(), LoadBalancingStrategy::LeastLoaded),
            );
        }
        if let Some(max) = state.pools.get(&pool_name).and_then(|p| p.max_agents) {
            let members = state
                .agents
                .values()
                .filter(|a| a.pool == pool_name && a.agent_id != reg.agent_id)
                .count();
            if members >= max as usize {
                return Err(AgentError::PoolFull {
                    pool: pool_name,
                    max,
                });
            }
        }

        let capabilities: BTreeSet<String> = reg.capabilities.into_iter().collect();
        let (agent, status) = match state.agents.get_mut(&reg.agent_id) {
            Some(existing) => {
                existing.agent_name = reg.agent_name.unwrap_or_else(|| reg.agent_id.to_string());
                existing.hostname = reg.hostname;
                existing.ip_address = reg.ip_address;
                existing.pool = pool_name.clone();
                existing.capabilities = capabilities;
                existing.max_parallel_jobs = reg.max_parallel_jobs;
                (existing.clone(), RegistrationStatus::Updated)
            }
            None => {
                let agent = Agent {
                    agent_name: reg.agent_name.unwrap_or_else(|| reg.agent_id.to_string()),
                    agent_id: reg.agent_id.clone(),
                    hostname: reg.hostname,
                    ip_address: reg.ip_address,
                    pool: pool_name.clone(),
                    capabilities,
                    max_parallel_jobs: reg.max_parallel_jobs,
                    status: AgentStatus::Offline,
                    last_heartbeat: None,
                    current_jobs: 0,
                    is_approved: self.auto_approve,
                    is_active: true,
                    cpu_percent: None,
                    memory_percent: None,
                    disk_percent: None,
                    registered_at: now,
                    last_job_completed: None,
                    reserved: 0,
                };
                state.agents.insert(reg.agent_id.clone(), agent.clone());
                (agent, RegistrationStatus::Created)
            }
        };

        let pool = new_pool.then(|| state.pools.get(&pool_name).cloned()).flatten();
        drop(state);

        if let Some(pool) = pool {
            self.persist_pool(&pool);
        }
        self.persist(&agent);
        info!(pool = %agent.pool, ?status, "agent registered");
        Ok((agent, status))
    }

    /// Record a heartbeat: refresh liveness, load and resource metrics.
    pub fn heartbeat(&self, agent_id: &AgentId, hb: Heartbeat, now: DateTime<Utc>) -> Result<Agent> {
        let agent = {
            let mut state = self.state.lock().unwrap();
            let agent = state.agents.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
            let was = agent.status;
            agent.status = hb.status.unwrap_or(AgentStatus::Online);
            agent.last_heartbeat = Some(now);
            // A lagging report must not free a slot the dispatcher still holds.
            agent.current_jobs = hb.current_jobs.max(agent.reserved);
            agent.cpu_percent = hb.cpu_percent;
            agent.memory_percent = hb.memory_percent;
            agent.disk_percent = hb.disk_percent;
            if was != agent.status {
                info!(agent_id = %agent_id, from = %was, to = %agent.status, "agent status changed");
            }
            agent.clone()
        };
        self.persist(&agent);
        Ok(agent)
    }

    /// Mark every agent whose heartbeat is older than the offline window as offline.
    ///
    /// Returns the ids that changed.
    pub fn reap_at(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let reaped: Vec<Agent> = {
            let mut state = self.state.lock().unwrap();
            state
                .agents
                .values_mut()
                .filter(|a| a.status != AgentStatus::Offline && !a.is_fresh(now, self.offline_after))
                .map(|a| {
                    a.status = AgentStatus::Offline;
                    a.clone()
                })
                .collect()
        };
        for agent in &reaped {
            warn!(agent_id = %agent.agent_id, last_heartbeat = ?agent.last_heartbeat, "agent marked offline");
            self.persist(agent);
        }
        reaped.into_iter().map(|a| a.agent_id).collect()
    }

    /// Pick an eligible agent for `job` and take one of its slots.
    ///
    /// Agents in `avoid` are only used when nobody else qualifies.
    pub fn reserve(
        &self,
        job: &JobDefinition,
        avoid: &HashSet<AgentId>,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        let pool_name = job.pool();
        let chosen = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let strategy = state
                .pools
                .get(pool_name)
                .map(|p| p.strategy)
                .unwrap_or_default();

            let mut eligible: Vec<&Agent> = state
                .agents
                .values()
                .filter(|a| {
                    a.pool == pool_name
                        && a.is_eligible(now, self.offline_after)
                        && a.has_capabilities(&job.required_capabilities)
                })
                .collect();
            if eligible.is_empty() {
                return Err(AgentError::NoAgentAvailable(format!(
                    "no approved, online agent with free capacity in pool '{pool_name}'"
                )));
            }
            if eligible.iter().any(|a| !avoid.contains(&a.agent_id)) {
                eligible.retain(|a| !avoid.contains(&a.agent_id));
            }
            eligible.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

            let picked = match strategy {
                LoadBalancingStrategy::LeastLoaded => eligible
                    .iter()
                    .min_by(|a, b| {
                        a.load()
                            .total_cmp(&b.load())
                            .then(a.current_jobs.cmp(&b.current_jobs))
                    })
                    .map(|a| a.agent_id.clone()),
                LoadBalancingStrategy::Random => eligible
                    .choose(&mut rand::thread_rng())
                    .map(|a| a.agent_id.clone()),
                LoadBalancingStrategy::RoundRobin => {
                    let ids: Vec<AgentId> = eligible.iter().map(|a| a.agent_id.clone()).collect();
                    let cursor = state.cursors.entry(pool_name.to_string()).or_insert(0);
                    let id = ids[*cursor % ids.len()].clone();
                    *cursor = cursor.wrapping_add(1);
                    Some(id)
                }
            };
            let picked = picked.ok_or_else(|| AgentError::NoAgentAvailable(pool_name.to_string()))?;

            let agent = state
                .agents
                .get_mut(&picked)
                .ok_or_else(|| not_found(&picked))?;
            agent.reserved += 1;
            agent.current_jobs += 1;
            agent.clone()
        };
        self.persist(&chosen);
        Ok(chosen)
    }

    /// Give back a slot taken by [`reserve`](Self::reserve).
    pub fn release(&self, agent_id: &AgentId, completed_at: Option<DateTime<Utc>>) {
        let agent = {
            let mut state = self.state.lock().unwrap();
            let Some(agent) = state.agents.get_mut(agent_id) else {
                return;
            };
            agent.reserved = agent.reserved.saturating_sub(1);
            agent.current_jobs = agent.current_jobs.saturating_sub(1);
            if completed_at.is_some() {
                agent.last_job_completed = completed_at;
            }
            agent.clone()
        };
        self.persist(&agent);
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<Agent> {
        self.state.lock().unwrap().agents.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.state.lock().unwrap().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Allow (or stop allowing) an agent to receive work.
    pub fn set_approved(&self, agent_id: &AgentId, approved: bool) -> Result<Agent> {
        let agent = self.update(agent_id, |a| a.is_approved = approved)?;
        info!(agent_id = %agent_id, approved, "agent approval changed");
        Ok(agent)
    }

    pub fn set_active(&self, agent_id: &AgentId, active: bool) -> Result<Agent> {
        let agent = self.update(agent_id, |a| a.is_active = active)?;
        info!(agent_id = %agent_id, active, "agent activation changed");
        Ok(agent)
    }

    pub fn remove(&self, agent_id: &AgentId) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .agents
            .remove(agent_id)
            .ok_or_else(|| not_found(agent_id))?;
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_agent(agent_id) {
                warn!(agent_id = %agent_id, err = %e, "failed to delete agent row");
            }
        }
        info!(agent_id = %agent_id, "agent removed");
        Ok(())
    }

    pub fn upsert_pool(&self, pool: AgentPool) -> Result<AgentPool> {
        if pool.name.trim().is_empty() {
            return Err(AgentError::InvalidRequest("pool name must not be empty".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .pools
            .insert(pool.name.clone(), pool.clone());
        self.persist_pool(&pool);
        info!(pool = %pool.name, strategy = %pool.strategy, "pool saved");
        Ok(pool)
    }

    pub fn pools(&self) -> Vec<AgentPool> {
        let mut pools: Vec<AgentPool> = self.state.lock().unwrap().pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    // ---- private helpers ----

    fn update(&self, agent_id: &AgentId, f: impl FnOnce(&mut Agent)) -> Result<Agent> {
        let agent = {
            let mut state = self.state.lock().unwrap();
            let agent = state.agents.get_mut(agent_id).ok_or_else(|| not_found(agent_id))?;
            f(agent);
            agent.clone()
        };
        self.persist(&agent);
        Ok(agent)
    }

    fn persist(&self, agent: &Agent) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_agent(agent) {
                warn!(agent_id = %agent.agent_id, err = %e, "failed to persist agent");
            }
        }
    }

    fn persist_pool(&self, pool: &AgentPool) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_pool(pool) {
                warn!(pool = %pool.name, err = %e, "failed to persist pool");
            }
        }
    }
}

fn not_found(agent_id: &AgentId) -> AgentError {
    AgentError::NotFound {
        kind: "agent",
        id: agent_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAgentStore;
    use serde_json::json;
    use tempo_core::StepConfig;

    fn registration(id: &str, caps: &[&str]) -> Registration {
        Registration {
            agent_id: AgentId::from(id),
            agent_name: None,
            hostname: format!("{id}.local"),
            ip_address: "10.0.0.2".into(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            max_parallel_jobs: 2,
            pool: None,
        }
    }

    fn job() -> JobDefinition {
        JobDefinition::new("remote", "UTC", vec![StepConfig::new("a", "echo", json!({"message": "x"}))])
    }

    fn online(reg: &AgentRegistry, id: &str, now: DateTime<Utc>) {
        reg.register(registration(id, &[]), now).unwrap();
        reg.set_approved(&AgentId::from(id), true).unwrap();
        reg.heartbeat(&AgentId::from(id), Heartbeat::default(), now).unwrap();
    }

    #[test]
    fn registration_starts_offline_and_reregistration_replaces_capabilities() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();

        let (agent, status) = reg.register(registration("a1", &["docker", "python"]), now).unwrap();
        assert_eq!(status, RegistrationStatus::Created);
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(!agent.is_approved);

        let (agent, status) = reg.register(registration("a1", &["gpu"]), now).unwrap();
        assert_eq!(status, RegistrationStatus::Updated);
        assert_eq!(agent.capabilities, BTreeSet::from(["gpu".to_string()]));
    }

    #[test]
    fn heartbeat_brings_agent_online() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();
        reg.register(registration("a1", &[]), now).unwrap();

        let agent = reg
            .heartbeat(
                &AgentId::from("a1"),
                Heartbeat {
                    cpu_percent: Some(40.0),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.cpu_percent, Some(40.0));
    }

    #[test]
    fn unapproved_agent_is_never_selected() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();
        reg.register(registration("a1", &[]), now).unwrap();
        reg.heartbeat(&AgentId::from("a1"), Heartbeat::default(), now).unwrap();

        let err = reg.reserve(&job(), &HashSet::new(), now).unwrap_err();
        assert!(matches!(err, AgentError::NoAgentAvailable(_)));
    }

    #[test]
    fn silent_agent_becomes_ineligible_and_is_reaped() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();
        online(&reg, "a1", now);

        let later = now + Duration::seconds(91);
        // Ineligible even before the reaper runs.
        assert!(reg.reserve(&job(), &HashSet::new(), later).is_err());
        assert_eq!(reg.reap_at(later), vec![AgentId::from("a1")]);
        assert_eq!(reg.get(&AgentId::from("a1")).unwrap().status, AgentStatus::Offline);
        assert!(reg.reap_at(later).is_empty());
    }

    #[test]
    fn least_loaded_spreads_work_and_respects_capacity() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();
        online(&reg, "a1", now);
        online(&reg, "a2", now);

        let picks: Vec<String> = (0..4)
            .map(|_| reg.reserve(&job(), &HashSet::new(), now).unwrap().agent_id.0)
            .collect();
        assert_eq!(picks, vec!["a1", "a2", "a1", "a2"]);

        // Both agents are at max_parallel_jobs = 2.
        assert!(reg.reserve(&job(), &HashSet::new(), now).is_err());

        reg.release(&AgentId::from("a2"), Some(now));
        assert_eq!(reg.reserve(&job(), &HashSet::new(), now).unwrap().agent_id.as_str(), "a2");
    }

    #[test]
    fn heartbeat_cannot_undercount_reserved_slots() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();
        online(&reg, "a1", now);
        reg.reserve(&job(), &HashSet::new(), now).unwrap();

        let agent = reg.heartbeat(&AgentId::from("a1"), Heartbeat::default(), now).unwrap();
        assert_eq!(agent.current_jobs, 1);
    }

    #[test]
    fn required_capabilities_and_pool_filter_candidates() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let now = Utc::now();
        let mut gpu = registration("gpu-1", &["gpu", "python"]);
        gpu.pool = Some("ml".into());
        reg.register(gpu, now).unwrap();
        reg.set_approved(&AgentId::from("gpu-1"), true).unwrap();
        reg.heartbeat(&AgentId::from("gpu-1"), Heartbeat::default(), now).unwrap();
        online(&reg, "cpu-1", now);

        let mut j = job();
        j.required_capabilities = vec!["gpu".into()];
        assert!(reg.reserve(&j, &HashSet::new(), now).is_err(), "default pool has no gpu");

        j.preferred_pool = Some("ml".into());
        assert_eq!(reg.reserve(&j, &HashSet::new(), now).unwrap().agent_id.as_str(), "gpu-1");
    }

    #[test]
    fn round_robin_rotates_and_avoid_is_a_preference() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        reg.upsert_pool(AgentPool::new("default", LoadBalancingStrategy::RoundRobin))
            .unwrap();
        let now = Utc::now();
        for id in ["a1", "a2", "a3"] {
            online(&reg, id, now);
        }

        let first = reg.reserve(&job(), &HashSet::new(), now).unwrap().agent_id;
        let second = reg.reserve(&job(), &HashSet::new(), now).unwrap().agent_id;
        assert_ne!(first, second);

        let avoid = HashSet::from([AgentId::from("a1"), AgentId::from("a2")]);
        assert_eq!(reg.reserve(&job(), &avoid, now).unwrap().agent_id.as_str(), "a3");
    }

    #[test]
    fn full_pool_rejects_new_members() {
        let reg = AgentRegistry::new(Duration::seconds(90));
        let mut pool = AgentPool::new("tiny", LoadBalancingStrategy::LeastLoaded);
        pool.max_agents = Some(1);
        reg.upsert_pool(pool).unwrap();
        let now = Utc::now();

        let mut r1 = registration("a1", &[]);
        r1.pool = Some("tiny".into());
        reg.register(r1.clone(), now).unwrap();
        // Re-registering the same agent is still allowed.
        reg.register(r1, now).unwrap();

        let mut r2 = registration("a2", &[]);
        r2.pool = Some("tiny".into());
        assert!(matches!(reg.register(r2, now), Err(AgentError::PoolFull { .. })));
    }

    #[test]
    fn restored_agents_start_offline() {
        let store = Arc::new(SqliteAgentStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
        let now = Utc::now();
        {
            let reg = AgentRegistry::new(Duration::seconds(90))
                .with_store(store.clone())
                .unwrap();
            online(&reg, "a1", now);
        }
        let reg = AgentRegistry::new(Duration::seconds(90)).with_store(store).unwrap();
        let agent = reg.get(&AgentId::from("a1")).unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.is_approved);
    }
}
