//! REST endpoints over the connection registry

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::protocol::Payload;

use super::HubState;
use super::error::{HubError, HubResult};
use super::ingest::Identity;

/// GET /api/v1/health
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /api/v1/agents
pub async fn list_agents(State(state): State<HubState>) -> HubResult<Json<Value>> {
    let agents = state.registry.connected().await?;

    Ok(Json(json!({
        "count": agents.len(),
        "agents": agents,
    })))
}

/// GET /api/v1/agents/{id}
pub async fn agent_status(
    State(state): State<HubState>,
    Path(id): Path<String>,
) -> HubResult<Json<Value>> {
    let identity = Identity::new(id);
    let connected = state.registry.is_connected(&identity).await?;

    Ok(Json(json!({
        "id": identity,
        "connected": connected,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Box<serde_json::value::RawValue>>,
}

/// POST /api/v1/agents/{id}/push
///
/// Queues a message for a connected agent. Answers 202 once queued; the
/// agent may still be slow to read it.
pub async fn push_to_agent(
    State(state): State<HubState>,
    Path(id): Path<String>,
    Json(request): Json<PushRequest>,
) -> HubResult<(StatusCode, Json<Value>)> {
    let payload = Payload::from_parts(&request.kind, request.data.as_deref())
        .map_err(|e| HubError::InvalidRequest(e.to_string()))?;
    if !matches!(payload, Payload::ConfigUpdate(_) | Payload::Command(_)) {
        return Err(HubError::InvalidRequest(format!(
            "`{}` messages cannot be pushed to agents",
            request.kind
        )));
    }

    let identity = Identity::new(id);
    state.registry.push(&identity, payload).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "queued": true }))))
}

/// DELETE /api/v1/agents/{id}
pub async fn disconnect_agent(
    State(state): State<HubState>,
    Path(id): Path<String>,
) -> HubResult<StatusCode> {
    let identity = Identity::new(id);
    if state.registry.disconnect(&identity).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HubError::NotConnected(format!("agent `{identity}` is not connected")))
    }
}
