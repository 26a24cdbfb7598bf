//! Metric search handlers.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::envelope::{render, ListEnvelope, TimeFormat};
use super::{with_deadline, AppState};
use crate::error::Result;
use crate::model::MetricKind;
use crate::store::{MetricPointRow, MetricQuery, Page, TimeField, TimeRange};

#[derive(Debug, Deserialize)]
pub struct MetricSearchParams {
    pub start_time: i64,
    pub end_time: i64,
    pub service_name: Option<String>,
    pub metric_name: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct MetricPointDto {
    pub time_unix_nanos: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time_unix_nanos: Option<i64>,
    pub metric_name: String,
    pub kind: MetricKind,
    pub unit: String,
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub attributes: serde_json::Value,
    pub payload: serde_json::Value,
}

impl From<MetricPointRow> for MetricPointDto {
    fn from(row: MetricPointRow) -> Self {
        Self {
            time_unix_nanos: row.time_unix_nanos,
            start_time_unix_nanos: row.start_time_unix_nanos,
            metric_name: row.metric_name,
            kind: MetricKind::from_i16(row.metric_kind),
            unit: row.unit,
            service_name: row.service_name,
            value: row.value,
            attributes: row.attrs,
            payload: row.payload,
        }
    }
}

/// `GET /api/metrics/search`
pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MetricSearchParams>,
) -> Result<Response> {
    state.schema.check_reads()?;
    let format = TimeFormat::from_headers(&headers);

    let query = MetricQuery {
        range: TimeRange {
            start_nanos: params.start_time,
            end_nanos: params.end_time,
            field: TimeField::Event,
        },
        service_name: params.service_name,
        metric_name: params.metric_name,
        page: Page {
            limit: params.limit,
            offset: params.offset,
            cursor: None,
        },
    };
    let limit = query.page.effective_limit();

    let page = with_deadline(state.config.query_deadline, async {
        state.store.search_metrics(&query).await
    })
    .await?;

    let envelope = ListEnvelope::new(
        page.items
            .into_iter()
            .map(MetricPointDto::from)
            .collect::<Vec<_>>(),
        limit,
        params.offset,
        page.has_more,
    );
    Ok(render(format, &envelope))
}
