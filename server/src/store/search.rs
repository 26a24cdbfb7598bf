//! Time-bounded search over facts.
//!
//! Filters are an AND-composition over a fixed per-signal field schema;
//! unknown fields are rejected rather than guessed. Regex patterns are
//! compiled with the host regex library first (reject → `Invalid`) and
//! evaluated by Postgres. All windows are clamped to the retention horizon
//! so queries never return rows the retention policy has disavowed.

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Postgres, QueryBuilder};

use super::Store;
use crate::error::{Error, Result};
use crate::model::{SpanKind, StatusCode, TraceId};

/// Hard cap on page sizes across every search surface.
pub const MAX_PAGE_SIZE: i64 = 1000;

const DEFAULT_PAGE_SIZE: i64 = 100;

// ============================================================================
// Query inputs
// ============================================================================

/// Filter operators over the fixed field schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Regex,
}

impl FilterOp {
    const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            // Contains/Regex render their own SQL.
            Self::Contains | Self::Regex => "",
        }
    }

    const fn is_ordering(self) -> bool {
        matches!(self, Self::Gt | Self::Gte | Self::Lt | Self::Lte)
    }
}

/// One predicate of an AND-composed filter set.
#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

/// Which timestamp participates in the window predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeField {
    /// Originating event time.
    #[default]
    Event,
    /// Ingest time.
    Db,
    /// Collector-observed time (falls back to event time where a signal
    /// carries none).
    Observed,
}

/// A query time window in Unix nanoseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeRange {
    pub start_nanos: i64,
    pub end_nanos: i64,
    #[serde(default)]
    pub field: TimeField,
}

impl TimeRange {
    fn validate(&self) -> Result<()> {
        if self.end_nanos < self.start_nanos {
            return Err(Error::invalid("time range end precedes start"));
        }
        Ok(())
    }
}

/// Paging: offset on the simple surfaces, opaque cursor on span search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl Page {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

// ============================================================================
// Cursor tokens
// ============================================================================

/// A cursor is opaque base64 over `(sort_value, tiebreak_key)`. Pages
/// continue strictly after the cursor position under the fixed sort, so a
/// cursor keeps excluding already-seen keys even as newer rows arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorToken {
    v: i64,
    k: String,
}

fn encode_cursor(sort_value: i64, tiebreak: &str) -> String {
    let token = CursorToken {
        v: sort_value,
        k: tiebreak.to_owned(),
    };
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&token).expect("cursor token serializes"))
}

fn decode_cursor(cursor: &str) -> Result<(i64, String)> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::invalid("malformed pagination cursor"))?;
    let token: CursorToken =
        serde_json::from_slice(&bytes).map_err(|_| Error::invalid("malformed pagination cursor"))?;
    Ok((token.v, token.k))
}

// ============================================================================
// Field schemas
// ============================================================================

#[derive(Debug, Clone)]
enum FieldExpr {
    /// A typed column (possibly an expression) on the joined row.
    Column(&'static str, FieldType),
    /// A promoted attribute lookup: `<attrs_col> ->> key`.
    Attr(&'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Text,
    Int,
    Kind,
    Status,
    Id16,
    Id8,
}

fn span_field(field: &str) -> Result<FieldExpr> {
    Ok(match field {
        "name" => FieldExpr::Column("s.name", FieldType::Text),
        "kind" => FieldExpr::Column("s.kind", FieldType::Kind),
        "status" => FieldExpr::Column("s.status_code", FieldType::Status),
        "service.name" => FieldExpr::Column("svc.name", FieldType::Text),
        "service.namespace" => FieldExpr::Column("svc.namespace", FieldType::Text),
        "duration_ns" => FieldExpr::Column("s.duration_nanos", FieldType::Int),
        "trace_id" => FieldExpr::Column("s.trace_id", FieldType::Id16),
        "span_id" => FieldExpr::Column("s.span_id", FieldType::Id8),
        _ => {
            if let Some(key) = field.strip_prefix("attributes.") {
                FieldExpr::Attr("s.attrs", key.to_owned())
            } else {
                return Err(Error::invalid(format!("unknown span filter field: {field}")));
            }
        }
    })
}

fn log_field(field: &str) -> Result<FieldExpr> {
    Ok(match field {
        "severity_number" => FieldExpr::Column("l.severity_number", FieldType::Int),
        "severity_text" => FieldExpr::Column("l.severity_text", FieldType::Text),
        "body" => FieldExpr::Column("l.body #>> '{}'", FieldType::Text),
        "service.name" => FieldExpr::Column("svc.name", FieldType::Text),
        "trace_id" => FieldExpr::Column("l.trace_id", FieldType::Id16),
        _ => {
            if let Some(key) = field.strip_prefix("attributes.") {
                FieldExpr::Attr("l.attrs", key.to_owned())
            } else {
                return Err(Error::invalid(format!("unknown log filter field: {field}")));
            }
        }
    })
}

/// Render one predicate into the builder. Every user value travels as a
/// bind parameter; only schema-fixed column expressions reach the SQL text.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, expr: &FieldExpr, filter: &Filter) -> Result<()> {
    qb.push(" AND ");
    match expr {
        FieldExpr::Column(col, FieldType::Text) => {
            let value = filter
                .value
                .as_str()
                .ok_or_else(|| Error::invalid(format!("field {} expects a string", filter.field)))?;
            push_text_predicate(qb, col, filter.op, value)?;
        }
        FieldExpr::Column(col, FieldType::Int) => {
            let value = filter.value.as_i64().ok_or_else(|| {
                Error::invalid(format!("field {} expects an integer", filter.field))
            })?;
            if matches!(filter.op, FilterOp::Contains | FilterOp::Regex) {
                return Err(Error::invalid(format!(
                    "operator not applicable to numeric field {}",
                    filter.field
                )));
            }
            qb.push(*col).push(" ").push(filter.op.sql()).push(" ").push_bind(value);
        }
        FieldExpr::Column(col, FieldType::Kind) => {
            let kind = parse_kind(&filter.value)?;
            push_enum_predicate(qb, col, filter.op, kind.as_i16(), &filter.field)?;
        }
        FieldExpr::Column(col, FieldType::Status) => {
            let status = parse_status(&filter.value)?;
            push_enum_predicate(qb, col, filter.op, status.as_i16(), &filter.field)?;
        }
        FieldExpr::Column(col, width @ (FieldType::Id16 | FieldType::Id8)) => {
            let hex = filter
                .value
                .as_str()
                .ok_or_else(|| Error::invalid("identifier filters expect lowercase hex"))?;
            let bytes = hex::decode(hex).map_err(|_| Error::invalid("malformed identifier"))?;
            let expected = if *width == FieldType::Id16 { 16 } else { 8 };
            if bytes.len() != expected {
                return Err(Error::invalid(format!(
                    "identifier must be {expected} bytes of hex"
                )));
            }
            match filter.op {
                FilterOp::Eq => {
                    qb.push(*col).push(" = ").push_bind(bytes);
                }
                FilterOp::Ne => {
                    qb.push(*col).push(" <> ").push_bind(bytes);
                }
                _ => {
                    return Err(Error::invalid(
                        "identifier fields support only eq and ne",
                    ))
                }
            }
        }
        FieldExpr::Attr(attrs_col, key) => {
            if filter.op.is_ordering() || filter.value.is_number() {
                // Numeric comparison against a JSON attribute: guard the
                // cast so non-numeric rows fall out instead of erroring.
                let value = filter
                    .value
                    .as_f64()
                    .ok_or_else(|| Error::invalid("ordering on attributes expects a number"))?;
                if matches!(filter.op, FilterOp::Contains | FilterOp::Regex) {
                    return Err(Error::invalid(
                        "operator not applicable to numeric attribute values",
                    ));
                }
                qb.push("(")
                    .push(*attrs_col)
                    .push(" ->> ")
                    .push_bind(key.clone())
                    .push(" ~ '^-?\\d+(\\.\\d+)?$' AND (")
                    .push(*attrs_col)
                    .push(" ->> ")
                    .push_bind(key.clone())
                    .push(")::numeric ")
                    .push(filter.op.sql())
                    .push(" ")
                    .push_bind(value)
                    .push(")");
            } else {
                let value = filter
                    .value
                    .as_str()
                    .ok_or_else(|| Error::invalid("attribute filters expect a string or number"))?;
                let mut expr = String::from("(");
                expr.push_str(attrs_col);
                expr.push_str(" ->> ");
                qb.push(expr);
                qb.push_bind(key.clone());
                qb.push(")");
                push_text_op(qb, filter.op, value)?;
            }
        }
    }
    Ok(())
}

fn push_text_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    col: &str,
    op: FilterOp,
    value: &str,
) -> Result<()> {
    qb.push(col);
    push_text_op(qb, op, value)
}

fn push_text_op(qb: &mut QueryBuilder<'_, Postgres>, op: FilterOp, value: &str) -> Result<()> {
    match op {
        FilterOp::Contains => {
            qb.push(" ILIKE ")
                .push_bind(format!("%{}%", escape_like_pattern(value)));
        }
        FilterOp::Regex => {
            // Reject what the host regex library cannot compile; Postgres
            // evaluates the accepted subset.
            Regex::new(value).map_err(|e| Error::invalid(format!("invalid regex: {e}")))?;
            qb.push(" ~ ").push_bind(value.to_owned());
        }
        _ => {
            qb.push(" ")
                .push(op.sql())
                .push(" ")
                .push_bind(value.to_owned());
        }
    }
    Ok(())
}

fn push_enum_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    col: &str,
    op: FilterOp,
    encoded: i16,
    field: &str,
) -> Result<()> {
    match op {
        FilterOp::Eq => {
            qb.push(col).push(" = ").push_bind(encoded);
        }
        FilterOp::Ne => {
            qb.push(col).push(" <> ").push_bind(encoded);
        }
        _ => {
            return Err(Error::invalid(format!(
                "field {field} supports only eq and ne"
            )))
        }
    }
    Ok(())
}

fn parse_kind(value: &serde_json::Value) -> Result<SpanKind> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::invalid("kind filter expects a string"))?;
    Ok(match s {
        "unspecified" => SpanKind::Unspecified,
        "internal" => SpanKind::Internal,
        "server" => SpanKind::Server,
        "client" => SpanKind::Client,
        "producer" => SpanKind::Producer,
        "consumer" => SpanKind::Consumer,
        _ => return Err(Error::invalid(format!("unknown span kind: {s}"))),
    })
}

fn parse_status(value: &serde_json::Value) -> Result<StatusCode> {
    let s = value
        .as_str()
        .ok_or_else(|| Error::invalid("status filter expects a string"))?;
    Ok(match s {
        "unset" => StatusCode::Unset,
        "ok" => StatusCode::Ok,
        "error" => StatusCode::Error,
        _ => return Err(Error::invalid(format!("unknown status: {s}"))),
    })
}

/// Escape LIKE/ILIKE metacharacters in user-supplied search text.
fn escape_like_pattern(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

const fn span_time_col(field: TimeField) -> &'static str {
    match field {
        TimeField::Db => "s.db_time_unix_nanos",
        // Spans carry no separate collector-observed time.
        TimeField::Event | TimeField::Observed => "s.start_unix_nanos",
    }
}

const fn log_time_col(field: TimeField) -> &'static str {
    match field {
        TimeField::Event => "l.time_unix_nanos",
        TimeField::Db => "l.db_time_unix_nanos",
        TimeField::Observed => "COALESCE(l.observed_time_unix_nanos, l.time_unix_nanos)",
    }
}

// ============================================================================
// Row types
// ============================================================================

/// One span as returned by span search and trace detail.
#[derive(Debug, Clone, FromRow)]
pub struct SpanRow {
    pub trace_id: Vec<u8>,
    pub span_id: Vec<u8>,
    pub parent_span_id: Option<Vec<u8>>,
    pub name: String,
    pub kind: i16,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub duration_nanos: i64,
    pub status_code: i16,
    pub status_message: Option<String>,
    pub service_name: String,
    pub attrs: serde_json::Value,
    pub events: serde_json::Value,
    pub links: serde_json::Value,
    pub db_time_unix_nanos: i64,
}

/// One log record as returned by log search.
#[derive(Debug, Clone, FromRow)]
pub struct LogRow {
    pub id: i64,
    pub time_unix_nanos: i64,
    pub observed_time_unix_nanos: Option<i64>,
    pub severity_number: i16,
    pub severity_text: String,
    pub body: serde_json::Value,
    pub trace_id: Option<Vec<u8>>,
    pub span_id: Option<Vec<u8>>,
    pub service_name: String,
    pub attrs: serde_json::Value,
    pub db_time_unix_nanos: i64,
}

/// One metric point as returned by metric search.
#[derive(Debug, Clone, FromRow)]
pub struct MetricPointRow {
    pub time_unix_nanos: i64,
    pub start_time_unix_nanos: Option<i64>,
    pub metric_name: String,
    pub metric_kind: i16,
    pub unit: String,
    pub service_name: String,
    pub value: Option<f64>,
    pub attrs: serde_json::Value,
    pub payload: serde_json::Value,
}

/// Aggregate row of trace search.
#[derive(Debug, Clone)]
pub struct TraceSummary {
    pub trace_id: Vec<u8>,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub span_count: i64,
    pub error_count: i64,
    pub root_service_name: Option<String>,
    pub root_span_name: Option<String>,
}

/// A page of rows plus continuation state.
#[derive(Debug)]
pub struct RowPage<T> {
    pub items: Vec<T>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

// ============================================================================
// Search operations
// ============================================================================

/// Inputs to span search (the filterful POST surface).
#[derive(Debug, Clone, Deserialize)]
pub struct SpanQuery {
    #[serde(rename = "time_range")]
    pub range: TimeRange,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, rename = "pagination")]
    pub page: Page,
}

/// Inputs to log search.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub range: TimeRange,
    pub severity_min: Option<i32>,
    pub trace_id: Option<TraceId>,
    pub service_name: Option<String>,
    pub filters: Vec<Filter>,
    pub page: Page,
}

/// Inputs to trace search (the simple GET surface).
#[derive(Debug, Clone)]
pub struct TraceQuery {
    pub range: TimeRange,
    pub service_name: Option<String>,
    pub min_duration_ns: Option<i64>,
    pub page: Page,
}

/// Inputs to metric search.
#[derive(Debug, Clone)]
pub struct MetricQuery {
    pub range: TimeRange,
    pub service_name: Option<String>,
    pub metric_name: Option<String>,
    pub page: Page,
}

impl Store {
    /// Search individual spans with the full filter schema and cursor
    /// paging, sorted by `(time DESC, span_id DESC)`.
    #[tracing::instrument(skip(self, query))]
    pub async fn search_spans(&self, query: &SpanQuery) -> Result<RowPage<SpanRow>> {
        query.range.validate()?;
        let _permit = self.query_permit().await?;
        let limit = query.page.effective_limit();
        let start = self.clamp_to_horizon(query.range.start_nanos);
        let time_col = span_time_col(query.range.field);

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT s.trace_id, s.span_id, s.parent_span_id, s.name, s.kind, \
             s.start_unix_nanos, s.end_unix_nanos, s.duration_nanos, s.status_code, \
             s.status_message, svc.name AS service_name, s.attrs, s.events, s.links, \
             s.db_time_unix_nanos \
             FROM spans s JOIN services svc ON svc.id = s.service_id WHERE ",
        );
        qb.push(time_col).push(" >= ").push_bind(start);
        qb.push(" AND ").push(time_col).push(" <= ").push_bind(query.range.end_nanos);

        for filter in &query.filters {
            let expr = span_field(&filter.field)?;
            push_filter(&mut qb, &expr, filter)?;
        }

        if let Some(cursor) = &query.page.cursor {
            let (sort_value, key) = decode_cursor(cursor)?;
            let key_bytes = hex::decode(&key)
                .map_err(|_| Error::invalid("malformed pagination cursor"))?;
            qb.push(" AND (")
                .push(time_col)
                .push(", s.span_id) < (")
                .push_bind(sort_value)
                .push(", ")
                .push_bind(key_bytes)
                .push(")");
        }

        qb.push(" ORDER BY ")
            .push(time_col)
            .push(" DESC, s.span_id DESC LIMIT ")
            .push_bind(limit + 1);

        let mut rows: Vec<SpanRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);

        let next_cursor = if has_more {
            rows.last().map(|row| {
                let sort_value = match query.range.field {
                    TimeField::Db => row.db_time_unix_nanos,
                    TimeField::Event | TimeField::Observed => row.start_unix_nanos,
                };
                encode_cursor(sort_value, &hex::encode(&row.span_id))
            })
        } else {
            None
        };

        Ok(RowPage {
            items: rows,
            has_more,
            next_cursor,
        })
    }

    /// Search log records, sorted by `(time DESC, id DESC)`, offset paging.
    #[tracing::instrument(skip(self, query))]
    pub async fn search_logs(&self, query: &LogQuery) -> Result<RowPage<LogRow>> {
        query.range.validate()?;
        let _permit = self.query_permit().await?;
        let limit = query.page.effective_limit();
        let start = self.clamp_to_horizon(query.range.start_nanos);
        let time_col = log_time_col(query.range.field);

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT l.id, l.time_unix_nanos, l.observed_time_unix_nanos, l.severity_number, \
             l.severity_text, l.body, l.trace_id, l.span_id, svc.name AS service_name, \
             l.attrs, l.db_time_unix_nanos \
             FROM logs l JOIN services svc ON svc.id = l.service_id WHERE ",
        );
        qb.push(time_col).push(" >= ").push_bind(start);
        qb.push(" AND ").push(time_col).push(" <= ").push_bind(query.range.end_nanos);

        if let Some(severity_min) = query.severity_min {
            qb.push(" AND l.severity_number >= ").push_bind(severity_min as i16);
        }
        if let Some(trace_id) = query.trace_id {
            qb.push(" AND l.trace_id = ").push_bind(trace_id.0.to_vec());
        }
        if let Some(service) = &query.service_name {
            qb.push(" AND svc.name = ").push_bind(service.clone());
        }
        for filter in &query.filters {
            let expr = log_field(&filter.field)?;
            push_filter(&mut qb, &expr, filter)?;
        }

        qb.push(" ORDER BY ")
            .push(time_col)
            .push(" DESC, l.id DESC LIMIT ")
            .push_bind(limit + 1)
            .push(" OFFSET ")
            .push_bind(query.page.offset.max(0));

        let mut rows: Vec<LogRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);

        Ok(RowPage {
            items: rows,
            has_more,
            next_cursor: None,
        })
    }

    /// Search traces: aggregate spans per trace within the window, newest
    /// first, then resolve each page entry's root span.
    #[tracing::instrument(skip(self, query))]
    pub async fn search_traces(&self, query: &TraceQuery) -> Result<RowPage<TraceSummary>> {
        query.range.validate()?;
        let _permit = self.query_permit().await?;
        let limit = query.page.effective_limit();
        let start = self.clamp_to_horizon(query.range.start_nanos);

        #[derive(FromRow)]
        struct Aggregate {
            trace_id: Vec<u8>,
            start_unix_nanos: i64,
            end_unix_nanos: i64,
            span_count: i64,
            error_count: i64,
        }

        let rows: Vec<Aggregate> = sqlx::query_as(
            "SELECT s.trace_id, \
                 MIN(s.start_unix_nanos) AS start_unix_nanos, \
                 MAX(s.end_unix_nanos) AS end_unix_nanos, \
                 COUNT(*) AS span_count, \
                 COUNT(*) FILTER (WHERE s.status_code = 2) AS error_count \
             FROM spans s JOIN services svc ON svc.id = s.service_id \
             WHERE s.start_unix_nanos >= $1 AND s.start_unix_nanos <= $2 \
             GROUP BY s.trace_id \
             HAVING ($3::text IS NULL OR bool_or(svc.name = $3)) \
                AND ($4::bigint IS NULL OR MAX(s.duration_nanos) >= $4) \
             ORDER BY MIN(s.start_unix_nanos) DESC \
             LIMIT $5 OFFSET $6",
        )
        .bind(start)
        .bind(query.range.end_nanos)
        .bind(query.service_name.as_deref())
        .bind(query.min_duration_ns)
        .bind(limit + 1)
        .bind(query.page.offset.max(0))
        .fetch_all(self.pool())
        .await?;

        let has_more = rows.len() as i64 > limit;
        let rows = &rows[..rows.len().min(limit as usize)];

        let trace_ids: Vec<Vec<u8>> = rows.iter().map(|r| r.trace_id.clone()).collect();
        let roots = self.resolve_roots(&trace_ids).await?;

        let items = rows
            .iter()
            .map(|r| {
                let root = roots.get(r.trace_id.as_slice());
                TraceSummary {
                    trace_id: r.trace_id.clone(),
                    start_unix_nanos: r.start_unix_nanos,
                    end_unix_nanos: r.end_unix_nanos,
                    span_count: r.span_count,
                    error_count: r.error_count,
                    root_service_name: root.map(|(service, _)| service.clone()),
                    root_span_name: root.map(|(_, name)| name.clone()),
                }
            })
            .collect();

        Ok(RowPage {
            items,
            has_more,
            next_cursor: None,
        })
    }

    /// Search metric points within the window.
    #[tracing::instrument(skip(self, query))]
    pub async fn search_metrics(&self, query: &MetricQuery) -> Result<RowPage<MetricPointRow>> {
        query.range.validate()?;
        let _permit = self.query_permit().await?;
        let limit = query.page.effective_limit();
        let start = self.clamp_to_horizon(query.range.start_nanos);

        let mut rows: Vec<MetricPointRow> = sqlx::query_as(
            "SELECT p.time_unix_nanos, p.start_time_unix_nanos, \
                 d.name AS metric_name, d.kind AS metric_kind, d.unit, \
                 svc.name AS service_name, p.value, p.attrs, p.payload \
             FROM metric_points p \
             JOIN metric_descriptors d ON d.id = p.descriptor_id \
             JOIN services svc ON svc.id = p.service_id \
             WHERE p.time_unix_nanos >= $1 AND p.time_unix_nanos <= $2 \
               AND ($3::text IS NULL OR svc.name = $3) \
               AND ($4::text IS NULL OR d.name = $4) \
             ORDER BY p.time_unix_nanos DESC, p.id DESC \
             LIMIT $5 OFFSET $6",
        )
        .bind(start)
        .bind(query.range.end_nanos)
        .bind(query.service_name.as_deref())
        .bind(query.metric_name.as_deref())
        .bind(limit + 1)
        .bind(query.page.offset.max(0))
        .fetch_all(self.pool())
        .await?;

        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);

        Ok(RowPage {
            items: rows,
            has_more,
            next_cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let token = encode_cursor(1_700_000_000_000_000_000, "aabbccddeeff0011");
        let (v, k) = decode_cursor(&token).unwrap();
        assert_eq!(v, 1_700_000_000_000_000_000);
        assert_eq!(k, "aabbccddeeff0011");
    }

    #[test]
    fn garbage_cursor_is_invalid() {
        assert!(decode_cursor("not base64!!").is_err());
        let not_json = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"hello");
        assert!(decode_cursor(&not_json).is_err());
    }

    #[test]
    fn page_limit_is_clamped() {
        let page = Page {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(page.effective_limit(), MAX_PAGE_SIZE);
        let page = Page {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(page.effective_limit(), 1);
        let page = Page::default();
        assert_eq!(page.effective_limit(), 100);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(span_field("nonsense").is_err());
        assert!(log_field("nonsense").is_err());
        assert!(span_field("attributes.http.route").is_ok());
    }

    #[test]
    fn bad_regex_is_rejected_before_sql() {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE true");
        let filter = Filter {
            field: "name".into(),
            op: FilterOp::Regex,
            value: serde_json::json!("(unclosed"),
        };
        let expr = span_field("name").unwrap();
        let err = push_filter(&mut qb, &expr, &filter).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn identifier_filter_validates_width() {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE true");
        let filter = Filter {
            field: "trace_id".into(),
            op: FilterOp::Eq,
            value: serde_json::json!("aabb"), // 2 bytes, needs 16
        };
        let expr = span_field("trace_id").unwrap();
        assert!(push_filter(&mut qb, &expr, &filter).is_err());
    }

    #[test]
    fn ordering_on_enum_fields_is_rejected() {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 WHERE true");
        let filter = Filter {
            field: "kind".into(),
            op: FilterOp::Gt,
            value: serde_json::json!("server"),
        };
        let expr = span_field("kind").unwrap();
        assert!(push_filter(&mut qb, &expr, &filter).is_err());
    }

    #[test]
    fn like_escape_handles_metacharacters() {
        assert_eq!(escape_like_pattern("a%b_c"), "a\\%b\\_c");
        assert_eq!(escape_like_pattern("a\\b"), "a\\\\b");
        assert_eq!(escape_like_pattern("plain"), "plain");
    }

    #[test]
    fn inverted_range_is_invalid() {
        let range = TimeRange {
            start_nanos: 10,
            end_nanos: 5,
            field: TimeField::Event,
        };
        assert!(range.validate().is_err());
    }

    #[test]
    fn observed_log_time_falls_back_to_event() {
        assert!(log_time_col(TimeField::Observed).contains("COALESCE"));
        assert_eq!(span_time_col(TimeField::Observed), "s.start_unix_nanos");
    }
}
