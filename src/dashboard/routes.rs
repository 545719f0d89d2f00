//! Dashboard API route handlers.
//!
//! All endpoints return JSON read straight from the controller registry.
//! State is shared via `Arc<RiskController>`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::RiskController;
use crate::types::{AgentStatusReport, RiskHistoryEntry, StateHistoryEntry};

pub type AppState = Arc<RiskController>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub agent_id: String,
    pub state_history: Vec<StateHistoryEntry>,
    pub risk_history: Vec<RiskHistoryEntry>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/agents
pub async fn get_agents(State(controller): State<AppState>) -> Json<Vec<AgentStatusReport>> {
    let mut statuses = Vec::new();
    for id in controller.agent_ids().await {
        if let Some(machine) = controller.state_machine(&id).await {
            statuses.push(machine.lock().await.get_status());
        }
    }
    Json(statuses)
}

/// GET /api/agents/:id
pub async fn get_agent(
    State(controller): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentStatusReport>, StatusCode> {
    let machine = controller
        .state_machine(&agent_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    let status = machine.lock().await.get_status();
    Ok(Json(status))
}

/// GET /api/agents/:id/history
pub async fn get_agent_history(
    State(controller): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let machine = controller
        .state_machine(&agent_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    let sm = machine.lock().await;
    Ok(Json(HistoryResponse {
        agent_id,
        state_history: sm.get_state_history(),
        risk_history: sm.get_risk_history(),
    }))
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}
