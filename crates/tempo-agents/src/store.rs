use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use tempo_core::{AgentId, AssignmentId, ExecutionId, JobId};
use tracing::instrument;

use crate::db::init_db;
use crate::error::Result;
use crate::types::{Agent, AgentJobAssignment, AgentPool};

/// Narrow persistence interface used by the registry and dispatcher.
pub trait AgentStore: Send + Sync {
    fn save_agent(&self, agent: &Agent) -> Result<()>;
    fn delete_agent(&self, agent_id: &AgentId) -> Result<()>;
    fn load_agents(&self) -> Result<Vec<Agent>>;
    fn save_pool(&self, pool: &AgentPool) -> Result<()>;
    fn load_pools(&self) -> Result<Vec<AgentPool>>;
    fn save_assignment(&self, assignment: &AgentJobAssignment) -> Result<()>;
    fn load_assignment(&self, id: &AssignmentId) -> Result<Option<AgentJobAssignment>>;
    fn assignments_for_execution(&self, execution_id: &ExecutionId) -> Result<Vec<AgentJobAssignment>>;
}

/// SQLite-backed [`AgentStore`].
pub struct SqliteAgentStore {
    db: Mutex<Connection>,
}

impl SqliteAgentStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

impl AgentStore for SqliteAgentStore {
    #[instrument(skip(self, agent), fields(agent_id = %agent.agent_id))]
    fn save_agent(&self, agent: &Agent) -> Result<()> {
        let caps = serde_json::to_string(&agent.capabilities).unwrap_or_else(|_| "[]".to_string());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agents
             (agent_id, agent_name, hostname, ip_address, pool, capabilities,
              max_parallel_jobs, status, last_heartbeat, current_jobs, is_approved,
              is_active, cpu_percent, memory_percent, disk_percent, registered_at,
              last_job_completed)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
             ON CONFLICT(agent_id) DO UPDATE SET
              agent_name=excluded.agent_name, hostname=excluded.hostname,
              ip_address=excluded.ip_address, pool=excluded.pool,
              capabilities=excluded.capabilities,
              max_parallel_jobs=excluded.max_parallel_jobs, status=excluded.status,
              last_heartbeat=excluded.last_heartbeat, current_jobs=excluded.current_jobs,
              is_approved=excluded.is_approved, is_active=excluded.is_active,
              cpu_percent=excluded.cpu_percent, memory_percent=excluded.memory_percent,
              disk_percent=excluded.disk_percent,
              last_job_completed=excluded.last_job_completed",
            rusqlite::params![
                agent.agent_id.as_str(),
                agent.agent_name,
                agent.hostname,
                agent.ip_address,
                agent.pool,
                caps,
                agent.max_parallel_jobs,
                agent.status.to_string(),
                agent.last_heartbeat.map(|t| t.to_rfc3339()),
                agent.current_jobs,
                agent.is_approved,
                agent.is_active,
                agent.cpu_percent.map(f64::from),
                agent.memory_percent.map(f64::from),
                agent.disk_percent.map(f64::from),
                agent.registered_at.to_rfc3339(),
                agent.last_job_completed.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn delete_agent(&self, agent_id: &AgentId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM agents WHERE agent_id = ?1", [agent_id.as_str()])?;
        Ok(())
    }

    fn load_agents(&self) -> Result<Vec<Agent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT agent_id, agent_name, hostname, ip_address, pool, capabilities,
                    max_parallel_jobs, status, last_heartbeat, current_jobs, is_approved,
                    is_active, cpu_percent, memory_percent, disk_percent, registered_at,
                    last_job_completed
             FROM agents ORDER BY agent_id",
        )?;
        let agents = stmt
            .query_map([], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(agents)
    }

    fn save_pool(&self, pool: &AgentPool) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agent_pools (name, description, max_agents, strategy)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
              description=excluded.description, max_agents=excluded.max_agents,
              strategy=excluded.strategy",
            rusqlite::params![
                pool.name,
                pool.description,
                pool.max_agents,
                pool.strategy.to_string()
            ],
        )?;
        Ok(())
    }

    fn load_pools(&self) -> Result<Vec<AgentPool>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT name, description, max_agents, strategy FROM agent_pools ORDER BY name")?;
        let pools = stmt
            .query_map([], |row| {
                Ok(AgentPool {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    max_agents: row.get(2)?,
                    strategy: parse_enum(row, 3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pools)
    }

    #[instrument(skip(self, a), fields(assignment_id = %a.assignment_id, status = %a.status))]
    fn save_assignment(&self, a: &AgentJobAssignment) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agent_assignments
             (assignment_id, execution_id, agent_id, job_id, attempt, status, priority,
              timeout_minutes, assigned_at, accepted_at, started_at, completed_at,
              error_message)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(assignment_id) DO UPDATE SET
              status=excluded.status, accepted_at=excluded.accepted_at,
              started_at=excluded.started_at, completed_at=excluded.completed_at,
              error_message=excluded.error_message",
            rusqlite::params![
                a.assignment_id.as_str(),
                a.execution_id.as_str(),
                a.agent_id.as_str(),
                a.job_id.as_str(),
                a.attempt,
                a.status.to_string(),
                a.priority,
                a.timeout_minutes,
                a.assigned_at.to_rfc3339(),
                a.accepted_at.map(|t| t.to_rfc3339()),
                a.started_at.map(|t| t.to_rfc3339()),
                a.completed_at.map(|t| t.to_rfc3339()),
                a.error_message,
            ],
        )?;
        Ok(())
    }

    fn load_assignment(&self, id: &AssignmentId) -> Result<Option<AgentJobAssignment>> {
        let db = self.db.lock().unwrap();
        let found = db
            .query_row(
                &format!("{SELECT_ASSIGNMENT} WHERE assignment_id = ?1"),
                [id.as_str()],
                row_to_assignment,
            )
            .optional()?;
        Ok(found)
    }

    fn assignments_for_execution(&self, execution_id: &ExecutionId) -> Result<Vec<AgentJobAssignment>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare(&format!("{SELECT_ASSIGNMENT} WHERE execution_id = ?1 ORDER BY attempt"))?;
        let rows = stmt
            .query_map([execution_id.as_str()], row_to_assignment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ---- private helpers ----

const SELECT_ASSIGNMENT: &str = "SELECT assignment_id, execution_id, agent_id, job_id, attempt,
        status, priority, timeout_minutes, assigned_at, accepted_at, started_at,
        completed_at, error_message
 FROM agent_assignments";

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let caps_json: String = row.get(5)?;
    let capabilities = serde_json::from_str(&caps_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(Agent {
        agent_id: AgentId(row.get(0)?),
        agent_name: row.get(1)?,
        hostname: row.get(2)?,
        ip_address: row.get(3)?,
        pool: row.get(4)?,
        capabilities,
        max_parallel_jobs: row.get(6)?,
        status: parse_enum(row, 7)?,
        last_heartbeat: parse_opt_ts(row, 8)?,
        current_jobs: row.get(9)?,
        is_approved: row.get(10)?,
        is_active: row.get(11)?,
        cpu_percent: row.get::<_, Option<f64>>(12)?.map(|v| v as f32),
        memory_percent: row.get::<_, Option<f64>>(13)?.map(|v| v as f32),
        disk_percent: row.get::<_, Option<f64>>(14)?.map(|v| v as f32),
        registered_at: parse_ts(row, 15)?,
        last_job_completed: parse_opt_ts(row, 16)?,
        reserved: 0,
    })
}

fn row_to_assignment(row: &Row<'_>) -> rusqlite::Result<AgentJobAssignment> {
    Ok(AgentJobAssignment {
        assignment_id: AssignmentId(row.get(0)?),
        execution_id: ExecutionId(row.get(1)?),
        agent_id: AgentId(row.get(2)?),
        job_id: JobId(row.get(3)?),
        attempt: row.get(4)?,
        status: parse_enum(row, 5)?,
        priority: row.get(6)?,
        timeout_minutes: row.get(7)?,
        assigned_at: parse_ts(row, 8)?,
        accepted_at: parse_opt_ts(row, 9)?,
        started_at: parse_opt_ts(row, 10)?,
        completed_at: parse_opt_ts(row, 11)?,
        error_message: row.get(12)?,
    })
}

fn parse_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => parse_ts(row, idx).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentStatus, AssignmentStatus, LoadBalancingStrategy};
    use std::collections::BTreeSet;

    fn store() -> SqliteAgentStore {
        SqliteAgentStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn agent(id: &str) -> Agent {
        let now = Utc::now();
        Agent {
            agent_id: AgentId::from(id),
            agent_name: id.to_string(),
            hostname: format!("{id}.local"),
            ip_address: "10.1.2.3".into(),
            pool: "default".into(),
            capabilities: BTreeSet::from(["docker".to_string(), "python".to_string()]),
            max_parallel_jobs: 4,
            status: AgentStatus::Online,
            last_heartbeat: Some(now),
            current_jobs: 1,
            is_approved: true,
            is_active: true,
            cpu_percent: Some(12.5),
            memory_percent: None,
            disk_percent: None,
            registered_at: now,
            last_job_completed: None,
            reserved: 3,
        }
    }

    #[test]
    fn default_pool_is_seeded() {
        let pools = store().load_pools().unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name, "default");
        assert_eq!(pools[0].strategy, LoadBalancingStrategy::LeastLoaded);
    }

    #[test]
    fn agent_upsert_replaces_fields() {
        let s = store();
        let mut a = agent("a1");
        s.save_agent(&a).unwrap();
        a.capabilities = BTreeSet::from(["gpu".to_string()]);
        a.status = AgentStatus::Maintenance;
        s.save_agent(&a).unwrap();

        let loaded = s.load_agents().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].capabilities, a.capabilities);
        assert_eq!(loaded[0].status, AgentStatus::Maintenance);
        assert_eq!(loaded[0].cpu_percent, Some(12.5));
        // Reservation counts live only in memory.
        assert_eq!(loaded[0].reserved, 0);

        s.delete_agent(&a.agent_id).unwrap();
        assert!(s.load_agents().unwrap().is_empty());
    }

    #[test]
    fn assignment_history_is_queryable_by_execution() {
        let s = store();
        let now = Utc::now();
        let exec = ExecutionId::new();
        let mut first = AgentJobAssignment {
            assignment_id: AssignmentId::new(),
            execution_id: exec.clone(),
            agent_id: AgentId::from("a1"),
            job_id: JobId::new(),
            attempt: 1,
            status: AssignmentStatus::Assigned,
            priority: 0,
            timeout_minutes: 60,
            assigned_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        s.save_assignment(&first).unwrap();
        first.transition(AssignmentStatus::Timeout, now).unwrap();
        first.error_message = Some("not accepted in time".into());
        s.save_assignment(&first).unwrap();

        let second = AgentJobAssignment {
            assignment_id: AssignmentId::new(),
            attempt: 2,
            agent_id: AgentId::from("a2"),
            status: AssignmentStatus::Assigned,
            completed_at: None,
            error_message: None,
            ..first.clone()
        };
        s.save_assignment(&second).unwrap();

        let history = s.assignments_for_execution(&exec).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, AssignmentStatus::Timeout);
        assert_eq!(history[1].agent_id.as_str(), "a2");
        assert_eq!(s.load_assignment(&first.assignment_id).unwrap().unwrap(), first);
    }
}
