//! Trace search and trace detail handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::envelope::{render, ListEnvelope, TimeFormat};
use super::spans::SpanDto;
use super::{with_deadline, AppState};
use crate::error::{Error, Result};
use crate::model::TraceId;
use crate::store::{Page, TimeRange, TraceQuery};

#[derive(Debug, Deserialize)]
pub struct TraceSearchParams {
    /// Window bounds in Unix nanoseconds.
    pub start_time: i64,
    pub end_time: i64,
    pub service_name: Option<String>,
    pub min_duration_ns: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct TraceSummaryDto {
    pub trace_id: String,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub duration_nanos: i64,
    pub span_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_span_name: Option<String>,
}

/// `GET /api/traces/search`
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TraceSearchParams>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);

    let query = TraceQuery {
        range: TimeRange {
            start_nanos: params.start_time,
            end_nanos: params.end_time,
            field: crate::store::TimeField::Event,
        },
        service_name: params.service_name,
        min_duration_ns: params.min_duration_ns,
        page: Page {
            limit: params.limit,
            offset: params.offset,
            cursor: None,
        },
    };
    let limit = query.page.effective_limit();

    let page = with_deadline(state.config.query_deadline, async {
        state.store.search_traces(&query).await
    })
    .await?;

    let items: Vec<TraceSummaryDto> = page
        .items
        .into_iter()
        .map(|t| TraceSummaryDto {
            trace_id: hex::encode(&t.trace_id),
            start_unix_nanos: t.start_unix_nanos,
            end_unix_nanos: t.end_unix_nanos,
            duration_nanos: t.end_unix_nanos - t.start_unix_nanos,
            span_count: t.span_count,
            error_count: t.error_count,
            root_service_name: t.root_service_name,
            root_span_name: t.root_span_name,
        })
        .collect();

    let envelope = ListEnvelope::new(items, limit, params.offset, page.has_more);
    Ok(render(format, &envelope))
}

#[derive(Debug, Deserialize)]
pub struct TraceDetailParams {
    /// Optional window; defaults to everything within retention.
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TraceDetailDto {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_span_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_service_name: Option<String>,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub duration_seconds: f64,
    pub span_count: usize,
    pub spans: Vec<SpanDto>,
}

/// `GET /api/traces/{trace_id}`
pub async fn detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(trace_id): Path<String>,
    Query(params): Query<TraceDetailParams>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);

    let trace_id = TraceId::from_hex(&trace_id)
        .ok_or_else(|| Error::invalid("trace_id must be 32 lowercase hex characters"))?;
    let start = params.start_time.unwrap_or(0);
    let end = params.end_time.unwrap_or_else(|| {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    });

    let detail = with_deadline(state.config.query_deadline, async {
        state.store.get_trace_detail(trace_id, start, end).await
    })
    .await?;

    let dto = TraceDetailDto {
        trace_id: detail.trace_id.to_hex(),
        root_span_id: detail.root_span_id.as_deref().map(hex::encode),
        root_span_name: detail.root_span_name,
        root_service_name: detail.root_service_name,
        start_unix_nanos: detail.start_unix_nanos,
        end_unix_nanos: detail.end_unix_nanos,
        duration_seconds: (detail.end_unix_nanos - detail.start_unix_nanos) as f64 / 1e9,
        span_count: detail.spans.len(),
        spans: detail.spans.into_iter().map(SpanDto::from).collect(),
    };
    Ok(render(format, &dto))
}
