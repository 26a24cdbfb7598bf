//! Health endpoints.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::error::Result;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
}

/// `GET /health` — static liveness.
pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct DbHealth {
    pub status: &'static str,
    pub schema_version: i64,
    pub writes_ready: bool,
    pub reads_ready: bool,
    pub queue_depth_traces: usize,
    pub queue_depth_logs: usize,
    pub queue_depth_metrics: usize,
}

/// `GET /health/db` — database reachability, schema gate state, and the
/// admission-queue depths that drive backpressure.
pub async fn health_db(State(state): State<AppState>) -> Result<Json<DbHealth>> {
    state.store.ping().await?;
    let (traces, logs, metrics) = state.ingest.queue_depths();
    Ok(Json(DbHealth {
        status: "ok",
        schema_version: state.schema.version(),
        writes_ready: state.schema.writes_ready(),
        reads_ready: state.schema.reads_ready(),
        queue_depth_traces: traces,
        queue_depth_logs: logs,
        queue_depth_metrics: metrics,
    }))
}
