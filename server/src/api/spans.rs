//! Span search handlers and the span DTO shared with trace detail.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Serialize;

use super::envelope::{render, ListEnvelope, TimeFormat};
use super::{with_deadline, AppState};
use crate::error::Result;
use crate::model::{SpanKind, StatusCode};
use crate::store::{SpanQuery, SpanRow};

/// One span on the wire. Identifiers are lowercase hex; times are
/// nanoseconds (rewritten to RFC 3339 on the legacy surface).
#[derive(Debug, Serialize)]
pub struct SpanDto {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub duration_nanos: i64,
    pub duration_seconds: f64,
    pub status: SpanStatusDto,
    pub service_name: String,
    pub attributes: serde_json::Value,
    pub events: serde_json::Value,
    pub links: serde_json::Value,
    pub db_time_unix_nanos: i64,
}

#[derive(Debug, Serialize)]
pub struct SpanStatusDto {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<SpanRow> for SpanDto {
    fn from(row: SpanRow) -> Self {
        Self {
            trace_id: hex::encode(&row.trace_id),
            span_id: hex::encode(&row.span_id),
            parent_span_id: row.parent_span_id.as_deref().map(hex::encode),
            name: row.name,
            kind: SpanKind::from_i16(row.kind),
            start_unix_nanos: row.start_unix_nanos,
            end_unix_nanos: row.end_unix_nanos,
            duration_nanos: row.duration_nanos,
            duration_seconds: row.duration_nanos as f64 / 1e9,
            status: SpanStatusDto {
                code: StatusCode::from_i16(row.status_code),
                message: row.status_message,
            },
            service_name: row.service_name,
            attributes: row.attrs,
            events: row.events,
            links: row.links,
            db_time_unix_nanos: row.db_time_unix_nanos,
        }
    }
}

/// `POST /api/spans/search` — the filterful surface with cursor paging.
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(query): Json<SpanQuery>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);
    let limit = query.page.effective_limit();
    let offset = query.page.offset;

    let page = with_deadline(state.config.query_deadline, async {
        state.store.search_spans(&query).await
    })
    .await?;

    let envelope = ListEnvelope::new(
        page.items.into_iter().map(SpanDto::from).collect::<Vec<_>>(),
        limit,
        offset,
        page.has_more,
    )
    .with_cursor(page.next_cursor);
    Ok(render(format, &envelope))
}
