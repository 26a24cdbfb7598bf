//! Log search handlers.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::envelope::{render, ListEnvelope, TimeFormat};
use super::{with_deadline, AppState};
use crate::error::{Error, Result};
use crate::model::TraceId;
use crate::store::{LogQuery, LogRow, Page, TimeField, TimeRange};

#[derive(Debug, Deserialize)]
pub struct LogSearchParams {
    pub start_time: i64,
    pub end_time: i64,
    pub severity_min: Option<i32>,
    pub trace_id: Option<String>,
    pub service_name: Option<String>,
    #[serde(default)]
    pub time_field: TimeField,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct LogDto {
    pub time_unix_nanos: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_time_unix_nanos: Option<i64>,
    pub severity_number: i16,
    pub severity_text: String,
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub service_name: String,
    pub attributes: serde_json::Value,
    pub db_time_unix_nanos: i64,
}

impl From<LogRow> for LogDto {
    fn from(row: LogRow) -> Self {
        Self {
            time_unix_nanos: row.time_unix_nanos,
            observed_time_unix_nanos: row.observed_time_unix_nanos,
            severity_number: row.severity_number,
            severity_text: row.severity_text,
            body: row.body,
            trace_id: row.trace_id.as_deref().map(hex::encode),
            span_id: row.span_id.as_deref().map(hex::encode),
            service_name: row.service_name,
            attributes: row.attrs,
            db_time_unix_nanos: row.db_time_unix_nanos,
        }
    }
}

/// `GET /api/logs/search`
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LogSearchParams>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);

    let trace_id = params
        .trace_id
        .as_deref()
        .map(|raw| {
            TraceId::from_hex(raw)
                .ok_or_else(|| Error::invalid("trace_id must be 32 lowercase hex characters"))
        })
        .transpose()?;

    let query = LogQuery {
        range: TimeRange {
            start_nanos: params.start_time,
            end_nanos: params.end_time,
            field: params.time_field,
        },
        severity_min: params.severity_min,
        trace_id,
        service_name: params.service_name,
        filters: Vec::new(),
        page: Page {
            limit: params.limit,
            offset: params.offset,
            cursor: None,
        },
    };
    let limit = query.page.effective_limit();

    let page = with_deadline(state.config.query_deadline, async {
        state.store.search_logs(&query).await
    })
    .await?;

    let envelope = ListEnvelope::new(
        page.items.into_iter().map(LogDto::from).collect::<Vec<_>>(),
        limit,
        params.offset,
        page.has_more,
    );
    Ok(render(format, &envelope))
}
