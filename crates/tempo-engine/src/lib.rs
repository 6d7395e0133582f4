//! `tempo-engine`: runs job definitions.
//!
//! # Overview
//!
//! [`engine::ExecutionEngine`] executes a job's steps in order, locally
//! through a [`tempo_steps::StepRegistry`] or on a remote agent through the
//! [`tempo_agents::Dispatcher`], applying step and job timeouts,
//! `continue_on_failure` and job-level retries. Scheduled work waits in one
//! [`queue::TimezoneQueue`] per IANA timezone, each with its own bounded
//! worker pool. Finished executions land in an [`store::ExecutionStore`].
//!
//! [`scheduler::RecurringScheduler`] turns stored recurring definitions
//! (`Once`, `Interval`, `Daily`, `Weekly`, evaluated in the job's timezone)
//! into scheduled executions.

pub mod db;
pub mod engine;
pub mod error;
pub mod queue;
pub mod remote;
pub mod scheduler;
pub mod store;

pub use engine::{AttemptOutcome, EngineBuilder, ExecutionEngine, ScheduleAt};
pub use error::{Result, StoreError};
pub use queue::{QueueStatus, TimezoneQueue};
pub use scheduler::RecurringScheduler;
pub use store::{ExecutionStore, JobStore, MemoryExecutionStore, RecurringJob, SqliteExecutionStore};
