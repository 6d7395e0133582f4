//! `tempo-agents`: remote worker registry and job dispatch.
//!
//! # Overview
//!
//! [`registry::AgentRegistry`] tracks every registered agent: pool,
//! capabilities, approval and heartbeat-derived liveness.
//! [`dispatcher::Dispatcher`] binds executions to agents through
//! [`types::AgentJobAssignment`] records and walks them through
//!
//! ```text
//! assigned → accepted → running → {completed, failed, timeout, cancelled}
//! ```
//!
//! timing out assignments that are never accepted or whose agent goes
//! silent. Agents authenticate with HMAC-signed tokens from [`token`].

pub mod db;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod store;
pub mod token;
pub mod types;

pub use dispatcher::{AssignmentOutcome, Dispatcher, ResultReport};
pub use error::{AgentError, Result};
pub use registry::{AgentRegistry, Heartbeat, Registration, RegistrationStatus};
pub use store::{AgentStore, SqliteAgentStore};
pub use token::TokenSigner;
pub use types::{Agent, AgentJobAssignment, AgentPool, AgentStatus, AssignmentStatus, LoadBalancingStrategy};
