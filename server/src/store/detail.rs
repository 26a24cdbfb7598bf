//! Trace detail assembly and root-span selection.
//!
//! Spans come back in received order with parent/child fields intact; tree
//! construction is the caller's concern. Root selection: among parentless
//! spans, prefer kinds that can begin a trace (Server, Consumer, Internal),
//! tie-break by earliest start then lowest span id; degrade to any
//! parentless span, then to the earliest span, so a partial trace still
//! renders.

use std::collections::HashMap;

use sqlx::FromRow;

use super::search::SpanRow;
use super::Store;
use crate::error::{Error, Result};
use crate::model::{SpanKind, TraceId};

/// Window broadening applied when a trace is not found in the caller's
/// window: spans may have been exported well after the query range the UI
/// guessed.
const BROADEN_NANOS: i64 = 24 * 3600 * 1_000_000_000;

/// A minimal view of a span used for root selection.
#[derive(Debug, Clone, FromRow)]
pub struct SpanDetailRow {
    pub span_id: Vec<u8>,
    pub parent_span_id: Option<Vec<u8>>,
    pub kind: i16,
    pub start_unix_nanos: i64,
    pub name: String,
    pub service_name: String,
}

/// All spans of one trace plus the chosen root.
#[derive(Debug)]
pub struct TraceDetail {
    pub trace_id: TraceId,
    pub spans: Vec<SpanRow>,
    pub root_span_id: Option<Vec<u8>>,
    pub root_span_name: Option<String>,
    pub root_service_name: Option<String>,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
}

/// Pick the root span of a trace.
///
/// Candidates with no parent and an entry-capable kind win; ties break by
/// earliest start, then lowest span id.
pub fn choose_root(spans: &[SpanDetailRow]) -> Option<&SpanDetailRow> {
    let root_kind = |s: &&SpanDetailRow| {
        matches!(
            SpanKind::from_i16(s.kind),
            SpanKind::Server | SpanKind::Consumer | SpanKind::Internal
        )
    };
    let earliest = |a: &&SpanDetailRow, b: &&SpanDetailRow| {
        (a.start_unix_nanos, &a.span_id).cmp(&(b.start_unix_nanos, &b.span_id))
    };

    let parentless = spans.iter().filter(|s| s.parent_span_id.is_none());
    if let Some(root) = parentless.clone().filter(root_kind).min_by(earliest) {
        return Some(root);
    }
    if let Some(root) = parentless.min_by(earliest) {
        return Some(root);
    }
    spans.iter().min_by(earliest)
}

impl Store {
    /// Fetch all spans of a trace within (or near) the window.
    ///
    /// On a miss the window is broadened by ±24 h and retried once; spans
    /// return in received order.
    #[tracing::instrument(skip(self))]
    pub async fn get_trace_detail(
        &self,
        trace_id: TraceId,
        start_nanos: i64,
        end_nanos: i64,
    ) -> Result<TraceDetail> {
        let _permit = self.query_permit().await?;

        let start = self.clamp_to_horizon(start_nanos);
        let mut rows = self.fetch_trace_spans(trace_id, start, end_nanos).await?;
        if rows.is_empty() {
            rows = self
                .fetch_trace_spans(
                    trace_id,
                    self.clamp_to_horizon(start.saturating_sub(BROADEN_NANOS)),
                    end_nanos.saturating_add(BROADEN_NANOS),
                )
                .await?;
        }
        if rows.is_empty() {
            return Err(Error::not_found(format!(
                "trace {} not found in window",
                trace_id.to_hex()
            )));
        }

        let candidates: Vec<SpanDetailRow> = rows
            .iter()
            .map(|r| SpanDetailRow {
                span_id: r.span_id.clone(),
                parent_span_id: r.parent_span_id.clone(),
                kind: r.kind,
                start_unix_nanos: r.start_unix_nanos,
                name: r.name.clone(),
                service_name: r.service_name.clone(),
            })
            .collect();
        let root = choose_root(&candidates);

        let start_unix_nanos = rows.iter().map(|r| r.start_unix_nanos).min().unwrap_or(0);
        let end_unix_nanos = rows.iter().map(|r| r.end_unix_nanos).max().unwrap_or(0);

        Ok(TraceDetail {
            trace_id,
            root_span_id: root.map(|r| r.span_id.clone()),
            root_span_name: root.map(|r| r.name.clone()),
            root_service_name: root.map(|r| r.service_name.clone()),
            spans: rows,
            start_unix_nanos,
            end_unix_nanos,
        })
    }

    async fn fetch_trace_spans(
        &self,
        trace_id: TraceId,
        start_nanos: i64,
        end_nanos: i64,
    ) -> Result<Vec<SpanRow>> {
        let rows = sqlx::query_as(
            "SELECT s.trace_id, s.span_id, s.parent_span_id, s.name, s.kind, \
                 s.start_unix_nanos, s.end_unix_nanos, s.duration_nanos, s.status_code, \
                 s.status_message, svc.name AS service_name, s.attrs, s.events, s.links, \
                 s.db_time_unix_nanos \
             FROM spans s JOIN services svc ON svc.id = s.service_id \
             WHERE s.trace_id = $1 \
               AND s.start_unix_nanos >= $2 AND s.start_unix_nanos <= $3 \
             ORDER BY s.db_time_unix_nanos ASC, s.start_unix_nanos ASC, s.span_id ASC",
        )
        .bind(trace_id.0.to_vec())
        .bind(start_nanos)
        .bind(end_nanos)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Resolve the root span (service, name) for a set of traces, for the
    /// trace-search listing.
    pub(crate) async fn resolve_roots(
        &self,
        trace_ids: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, (String, String)>> {
        let mut roots = HashMap::new();
        if trace_ids.is_empty() {
            return Ok(roots);
        }

        #[derive(FromRow)]
        struct CandidateRow {
            trace_id: Vec<u8>,
            span_id: Vec<u8>,
            parent_span_id: Option<Vec<u8>>,
            kind: i16,
            start_unix_nanos: i64,
            name: String,
            service_name: String,
        }

        let candidates: Vec<CandidateRow> = sqlx::query_as(
            "SELECT s.trace_id, s.span_id, s.parent_span_id, s.kind, s.start_unix_nanos, \
                 s.name, svc.name AS service_name \
             FROM spans s JOIN services svc ON svc.id = s.service_id \
             WHERE s.trace_id = ANY($1) AND s.parent_span_id IS NULL",
        )
        .bind(trace_ids)
        .fetch_all(self.pool())
        .await?;

        let mut grouped: HashMap<Vec<u8>, Vec<SpanDetailRow>> = HashMap::new();
        for c in candidates {
            grouped.entry(c.trace_id.clone()).or_default().push(SpanDetailRow {
                span_id: c.span_id,
                parent_span_id: c.parent_span_id,
                kind: c.kind,
                start_unix_nanos: c.start_unix_nanos,
                name: c.name,
                service_name: c.service_name,
            });
        }
        for (trace_id, spans) in &grouped {
            if let Some(root) = choose_root(spans) {
                roots.insert(
                    trace_id.clone(),
                    (root.service_name.clone(), root.name.clone()),
                );
            }
        }

        // Traces made entirely of child spans (broken parent links or
        // partial export): fall back to their earliest span.
        let missing: Vec<Vec<u8>> = trace_ids
            .iter()
            .filter(|id| !roots.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let fallbacks: Vec<CandidateRow> = sqlx::query_as(
                "SELECT DISTINCT ON (s.trace_id) \
                     s.trace_id, s.span_id, s.parent_span_id, s.kind, s.start_unix_nanos, \
                     s.name, svc.name AS service_name \
                 FROM spans s JOIN services svc ON svc.id = s.service_id \
                 WHERE s.trace_id = ANY($1) \
                 ORDER BY s.trace_id, s.start_unix_nanos ASC, s.span_id ASC",
            )
            .bind(&missing)
            .fetch_all(self.pool())
            .await?;
            for f in fallbacks {
                roots.insert(f.trace_id, (f.service_name, f.name));
            }
        }

        Ok(roots)
    }
}
