use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8470;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const OFFLINE_MULTIPLIER: u32 = 3;
pub const TOKEN_TTL_SECS: u64 = 4 * 60 * 60;
pub const ACCEPT_TIMEOUT_SECS: u64 = 120;
pub const MAX_ASSIGNMENT_ATTEMPTS: u32 = 3;
pub const ASSIGNMENT_TIMEOUT_MINUTES: u64 = 60;

/// Top-level config (tempo.toml + TEMPO_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TempoConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token for the engine and admin routes. `None` leaves them open.
    pub admin_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker-pool size for a timezone queue without an explicit override.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,
    /// Per-timezone worker-pool sizes, keyed by IANA identifier.
    #[serde(default)]
    pub timezone_limits: HashMap<String, usize>,
    /// Used when neither the step config nor the step type sets a timeout.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,
}

impl EngineConfig {
    pub fn max_concurrent_for(&self, timezone: &str) -> usize {
        self.timezone_limits
            .get(timezone)
            .copied()
            .unwrap_or(self.default_max_concurrent)
            .max(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            timezone_limits: HashMap::new(),
            default_step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        }
    }
}

/// Registry, dispatcher and token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// An agent silent for longer than `heartbeat_interval × offline_multiplier` goes offline.
    #[serde(default = "default_offline_multiplier")]
    pub offline_multiplier: u32,
    /// HMAC key for agent tokens.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// How long an assignment may sit in `assigned` before it is timed out.
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_assignment_attempts: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_assignment_timeout")]
    pub assignment_timeout_minutes: u64,
    /// New registrations start approved. Meant for development setups.
    #[serde(default)]
    pub auto_approve: bool,
}

impl AgentsConfig {
    /// Heartbeat age after which an agent is considered offline.
    pub fn offline_after(&self) -> chrono::Duration {
        let secs = self
            .heartbeat_interval_secs
            .saturating_mul(u64::from(self.offline_multiplier));
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            offline_multiplier: OFFLINE_MULTIPLIER,
            token_secret: default_token_secret(),
            token_ttl_secs: TOKEN_TTL_SECS,
            accept_timeout_secs: ACCEPT_TIMEOUT_SECS,
            max_assignment_attempts: MAX_ASSIGNMENT_ATTEMPTS,
            sweep_interval_secs: default_sweep_interval(),
            assignment_timeout_minutes: ASSIGNMENT_TIMEOUT_MINUTES,
            auto_approve: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Settings read by the `tempo-worker` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Defaults to the machine's hostname.
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_jobs: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            agent_id: None,
            agent_name: None,
            pool: default_pool(),
            capabilities: Vec::new(),
            max_parallel_jobs: default_max_parallel(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl TempoConfig {
    /// Load from `config_path` (or `~/.tempo/tempo.toml`) with `TEMPO_*` overrides.
    ///
    /// Nested keys use a double underscore, e.g. `TEMPO_AGENTS__TOKEN_SECRET`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("TEMPO_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::TempoError::config(e.to_string()))
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}
fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_offline_multiplier() -> u32 {
    OFFLINE_MULTIPLIER
}
fn default_token_secret() -> String {
    "change-me".to_string()
}
fn default_token_ttl() -> u64 {
    TOKEN_TTL_SECS
}
fn default_accept_timeout() -> u64 {
    ACCEPT_TIMEOUT_SECS
}
fn default_max_attempts() -> u32 {
    MAX_ASSIGNMENT_ATTEMPTS
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_assignment_timeout() -> u64 {
    ASSIGNMENT_TIMEOUT_MINUTES
}
fn default_server_url() -> String {
    format!("http://{DEFAULT_BIND}:{DEFAULT_PORT}")
}
fn default_pool() -> String {
    crate::job::DEFAULT_POOL.to_string()
}
fn default_max_parallel() -> u32 {
    1
}
fn default_poll_interval() -> u64 {
    5
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_yields_defaults() {
        let cfg = TempoConfig::from_figment(Figment::new()).unwrap();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.engine.default_max_concurrent, 5);
        assert_eq!(cfg.agents.token_ttl_secs, 14_400);
        assert_eq!(cfg.agents.offline_after(), chrono::Duration::seconds(90));
        assert_eq!(cfg.worker.pool, "default");
    }

    #[test]
    fn toml_overrides_and_timezone_limits() {
        let toml = r#"
            [engine]
            default_max_concurrent = 2

            [engine.timezone_limits]
            "Asia/Tokyo" = 8

            [agents]
            heartbeat_interval_secs = 10
            token_secret = "s3cret"
        "#;
        let cfg = TempoConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap();

        assert_eq!(cfg.engine.max_concurrent_for("Asia/Tokyo"), 8);
        assert_eq!(cfg.engine.max_concurrent_for("Europe/Paris"), 2);
        assert_eq!(cfg.agents.offline_after(), chrono::Duration::seconds(30));
        assert_eq!(cfg.agents.token_secret, "s3cret");
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let mut engine = EngineConfig::default();
        engine.timezone_limits.insert("UTC".into(), 0);
        assert_eq!(engine.max_concurrent_for("UTC"), 1);
    }
}
