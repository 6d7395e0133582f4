//! `tempo-core`: shared model for the Tempo job engine.
//!
//! Holds everything the engine, the dispatcher and the remote worker must
//! agree on: configuration, the error taxonomy, identifiers, job definitions,
//! execution results, and timezone-aware schedule math.

pub mod config;
pub mod error;
pub mod job;
pub mod result;
pub mod schedule;
pub mod timezone;
pub mod types;

pub use error::{Result, TempoError};
pub use job::{ExecutionType, JobDefinition, StepConfig};
pub use result::{JobExecutionResult, JobStatus, StepExecutionResult, StepStatus};
pub use schedule::Schedule;
pub use types::{AgentId, AssignmentId, ExecutionId, JobId};
