use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tempo_agents::AgentStatus;

use crate::app::AppState;

/// GET /health: liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let agents = state.dispatcher.registry().list();
    let online = agents
        .iter()
        .filter(|a| a.status != AgentStatus::Offline)
        .count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "agents": agents.len(),
        "agents_online": online,
        "live_assignments": state.dispatcher.live().len(),
        "queues": state.engine.get_queue_status().len(),
    }))
}
