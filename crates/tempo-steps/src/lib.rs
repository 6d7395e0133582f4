//! `tempo-steps`: the step contract and everything needed to run a job's
//! steps in order.
//!
//! The same crate backs in-process execution in the engine and remote
//! execution inside `tempo-worker`, so a job behaves identically wherever it
//! lands.

pub mod builtin;
pub mod context;
pub mod error;
pub mod registry;
pub mod runner;
pub mod sequence;
pub mod step;
pub mod truncate;

pub use context::ExecutionContext;
pub use error::StepError;
pub use registry::StepRegistry;
pub use sequence::{job_deadline, run_sequence, SequenceOutcome};
pub use step::Step;
