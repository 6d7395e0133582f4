//! `tempo-protocol`: the JSON contract between the gateway and remote agents.
//!
//! Both sides compile against these types, so a field rename here is a wire
//! break. `tests/wire_compat.rs` pins the shapes.

pub mod messages;
pub mod routes;

pub use messages::{
    Ack, AssignmentPayload, ErrorBody, ErrorShape, HeartbeatAck, HeartbeatRequest, PollQuery,
    PollResponse, RegisterRequest, RegisterResponse, RegisterStatus, ReportedState,
    StatusUpdateRequest, SubmitResultRequest, WorkerState,
};
