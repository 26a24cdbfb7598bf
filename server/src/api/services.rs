//! Service catalog and service map handlers.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::envelope::{render, ListEnvelope, TimeFormat};
use super::{with_deadline, AppState};
use crate::error::Result;
use crate::store::{ServiceMapEdge, ServiceMapNode};

const DEFAULT_WINDOW_NANOS: i64 = 3600 * 1_000_000_000;

#[derive(Debug, Deserialize)]
pub struct ServiceListParams {
    /// Window bounds in Unix nanoseconds; defaults to the last hour.
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

fn window_or_default(start: Option<i64>, end: Option<i64>) -> (i64, i64) {
    let end = end.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    });
    let start = start.unwrap_or_else(|| end.saturating_sub(DEFAULT_WINDOW_NANOS));
    (start, end)
}

#[derive(Debug, Serialize)]
pub struct ServiceDto {
    pub name: String,
    pub namespace: String,
    pub request_count: i64,
    pub error_count: i64,
    pub error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99_ms: Option<f64>,
    pub first_seen_unix_nanos: i64,
    pub last_seen_unix_nanos: i64,
}

/// `GET /api/services`
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ServiceListParams>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);
    let (start, end) = window_or_default(params.start_time, params.end_time);

    let entries = with_deadline(state.config.query_deadline, async {
        state.store.list_services(start, end).await
    })
    .await?;

    let count = entries.len() as i64;
    let items: Vec<ServiceDto> = entries
        .into_iter()
        .map(|e| ServiceDto {
            error_rate: e.error_rate(),
            name: e.name,
            namespace: e.namespace,
            request_count: e.request_count,
            error_count: e.error_count,
            p50_ms: e.p50_ms,
            p95_ms: e.p95_ms,
            p99_ms: e.p99_ms,
            first_seen_unix_nanos: e.first_seen_unix_nanos,
            last_seen_unix_nanos: e.last_seen_unix_nanos,
        })
        .collect();

    let envelope = ListEnvelope::new(items, count.max(1), 0, false);
    Ok(render(format, &envelope))
}

#[derive(Debug, Deserialize)]
pub struct ServiceMapRequest {
    pub time_range: MapTimeRange,
}

#[derive(Debug, Deserialize)]
pub struct MapTimeRange {
    pub start_nanos: i64,
    pub end_nanos: i64,
}

#[derive(Debug, Serialize)]
pub struct ServiceMapDto {
    pub nodes: Vec<NodeDto>,
    pub edges: Vec<EdgeDto>,
}

#[derive(Debug, Serialize)]
pub struct NodeDto {
    pub name: String,
    pub request_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99_ms: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct EdgeDto {
    pub caller: String,
    pub callee: String,
    pub call_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

impl From<ServiceMapNode> for NodeDto {
    fn from(node: ServiceMapNode) -> Self {
        Self {
            name: node.name,
            request_count: node.request_count,
            error_count: node.error_count,
            p50_ms: node.p50_ms,
            p95_ms: node.p95_ms,
            p99_ms: node.p99_ms,
        }
    }
}

impl From<ServiceMapEdge> for EdgeDto {
    fn from(edge: ServiceMapEdge) -> Self {
        Self {
            caller: edge.caller,
            callee: edge.callee,
            call_count: edge.call_count,
            error_count: edge.error_count,
            avg_latency_ms: edge.avg_latency_ms,
        }
    }
}

/// `POST /api/service-map`
pub async fn service_map(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ServiceMapRequest>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);

    let map = with_deadline(state.config.query_deadline, async {
        state
            .store
            .build_service_map(request.time_range.start_nanos, request.time_range.end_nanos)
            .await
    })
    .await?;

    let dto = ServiceMapDto {
        nodes: map.nodes.into_iter().map(NodeDto::from).collect(),
        edges: map.edges.into_iter().map(EdgeDto::from).collect(),
    };
    Ok(render(format, &dto))
}
