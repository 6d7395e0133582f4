//! `tempo-worker`: a remote agent for the Tempo gateway.
//!
//! The worker registers, heartbeats, polls for assignments within its free
//! slots and runs each job with the same step registry and sequence rules
//! the engine uses in-process, then reports the result.

pub mod client;
pub mod error;
pub mod host;
pub mod worker;

pub use client::{GatewayApi, GatewayClient};
pub use error::{Result, WorkerError};
pub use worker::Worker;
