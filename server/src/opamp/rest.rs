//! OpAMP REST facade for operators.
//!
//! `GET /api/opamp/status`, `GET|POST /api/opamp/config`,
//! `GET /api/opamp/health`. Configuration bodies are YAML and validated
//! syntactically only; semantic validation is the collector's job.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::{AcceptReceipt, AgentStatusEntry};
use crate::api::AppState;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct InstanceQuery {
    pub instance_id: Option<String>,
}

impl InstanceQuery {
    fn parse(&self) -> Result<Option<Uuid>> {
        self.instance_id
            .as_deref()
            .map(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|_| Error::invalid(format!("malformed instance_id: {raw}")))
            })
            .transpose()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub agents: Vec<AgentStatusEntry>,
}

/// `GET /api/opamp/status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        agents: state.opamp.status_list(),
    })
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub instance_id: Uuid,
    pub effective_config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_hash: Option<String>,
}

/// `GET /api/opamp/config?instance_id=...`
pub async fn get_config(
    State(state): State<AppState>,
    Query(query): Query<InstanceQuery>,
) -> Result<Json<ConfigResponse>> {
    let agent = state.opamp.get_agent(query.parse()?)?;
    let effective_config = agent.effective_config.ok_or_else(|| {
        Error::not_found(format!(
            "agent {} has not reported an effective config",
            agent.instance_uid
        ))
    })?;
    Ok(Json(ConfigResponse {
        instance_id: agent.instance_uid,
        effective_config,
        pending_config: agent.pending.as_ref().map(|p| p.body.clone()),
        pending_hash: agent.pending.as_ref().map(|p| hex::encode(p.hash)),
    }))
}

/// `POST /api/opamp/config?instance_id=...` with a YAML body.
///
/// Addressed to one agent, or to every known agent when no id is given.
/// The update is stored as pending and rides out on the target's next
/// status report.
pub async fn post_config(
    State(state): State<AppState>,
    Query(query): Query<InstanceQuery>,
    body: String,
) -> Result<Json<AcceptReceipt>> {
    serde_yaml::from_str::<serde_yaml::Value>(&body)
        .map_err(|e| Error::invalid(format!("invalid YAML: {e}")))?;
    if body.trim().is_empty() {
        return Err(Error::invalid("config body is empty"));
    }
    let receipt = state.opamp.set_pending(query.parse()?, &body)?;
    Ok(Json(receipt))
}

#[derive(Debug, Serialize)]
pub struct OpampHealth {
    pub connected_agents: usize,
    pub known_agents: usize,
}

/// `GET /api/opamp/health`
pub async fn health(State(state): State<AppState>) -> Json<OpampHealth> {
    Json(OpampHealth {
        connected_agents: state.opamp.connected_count(),
        known_agents: state.opamp.total_count(),
    })
}
