//! Transactional batch writes.
//!
//! Dimensions are resolved first (cache or upsert, each idempotent), then
//! every fact row of the batch commits in one transaction. Duplicate facts
//! are absorbed by `ON CONFLICT DO NOTHING` on their idempotency keys, so
//! at-least-once producers observe exactly-once persistence.

use std::sync::Arc;

use sqlx::{Postgres, QueryBuilder};

use super::{Store, WriteOutcome};
use crate::error::Result;
use crate::model::value::attrs_to_json;
use crate::model::{
    FingerprintInput, LogGroup, LogRecord, MetricGroup, MetricPoint, SpanGroup, SpanRecord,
};

/// Multi-row INSERT chunk size. Postgres caps bind parameters at 65535;
/// the widest row below binds 16 values.
const INSERT_CHUNK: usize = 1024;

/// A span with its dimensions resolved, ready to insert.
struct SpanInsert<'a> {
    resource_id: i64,
    scope_id: i64,
    service_id: i64,
    span: &'a SpanRecord,
}

struct LogInsert<'a> {
    fp_hi: i64,
    fp_lo: i64,
    resource_id: i64,
    scope_id: i64,
    service_id: i64,
    log: &'a LogRecord,
}

struct PointInsert<'a> {
    fp_hi: i64,
    fp_lo: i64,
    descriptor_id: i64,
    resource_id: i64,
    scope_id: i64,
    point: &'a MetricPoint,
}

impl Store {
    /// Worker entry point for the trace signal.
    pub async fn write_span_groups(&self, groups: Arc<Vec<SpanGroup>>) -> Result<WriteOutcome> {
        self.write_batch(&groups, &[], &[]).await
    }

    /// Worker entry point for the log signal.
    pub async fn write_log_groups(&self, groups: Arc<Vec<LogGroup>>) -> Result<WriteOutcome> {
        self.write_batch(&[], &groups, &[]).await
    }

    /// Worker entry point for the metric signal.
    pub async fn write_metric_groups(&self, groups: Arc<Vec<MetricGroup>>) -> Result<WriteOutcome> {
        self.write_batch(&[], &[], &groups).await
    }

    /// Persist a batch atomically: either all fact rows commit or none.
    #[tracing::instrument(skip_all, fields(
        span_groups = spans.len(),
        log_groups = logs.len(),
        metric_groups = points.len(),
    ))]
    pub async fn write_batch(
        &self,
        spans: &[SpanGroup],
        logs: &[LogGroup],
        points: &[MetricGroup],
    ) -> Result<WriteOutcome> {
        let _permit = self.ingest_permit().await?;

        // Dimensions first, facts second. Dimension upserts are individually
        // idempotent so they can safely precede the fact transaction.
        let mut span_rows = Vec::new();
        for group in spans {
            let resource_id = self.upsert_resource(&group.resource).await?;
            let scope_id = self.upsert_scope(&group.scope).await?;
            let seen = group
                .spans
                .iter()
                .map(|s| s.start_unix_nanos)
                .max()
                .unwrap_or_default();
            let service_id = self
                .upsert_service(
                    group.resource.service_name(),
                    group.resource.service_namespace(),
                    seen,
                )
                .await?;
            for span in &group.spans {
                span_rows.push(SpanInsert {
                    resource_id,
                    scope_id,
                    service_id,
                    span,
                });
            }
        }

        let mut log_rows = Vec::new();
        for group in logs {
            let resource_id = self.upsert_resource(&group.resource).await?;
            let scope_id = self.upsert_scope(&group.scope).await?;
            let seen = group
                .logs
                .iter()
                .map(|l| l.time_unix_nanos)
                .max()
                .unwrap_or_default();
            let service_id = self
                .upsert_service(
                    group.resource.service_name(),
                    group.resource.service_namespace(),
                    seen,
                )
                .await?;
            for log in &group.logs {
                let fp = log_fingerprint(resource_id, log);
                log_rows.push(LogInsert {
                    fp_hi: fp.hi,
                    fp_lo: fp.lo,
                    resource_id,
                    scope_id,
                    service_id,
                    log,
                });
            }
        }

        let mut point_rows = Vec::new();
        for group in points {
            let resource_id = self.upsert_resource(&group.resource).await?;
            let scope_id = self.upsert_scope(&group.scope).await?;
            let seen = group
                .points
                .iter()
                .map(|p| p.time_unix_nanos)
                .max()
                .unwrap_or_default();
            let service_id = self
                .upsert_service(
                    group.resource.service_name(),
                    group.resource.service_namespace(),
                    seen,
                )
                .await?;
            for point in &group.points {
                let descriptor_id = self.upsert_metric_descriptor(&point.descriptor).await?;
                let fp = point_fingerprint(descriptor_id, resource_id, scope_id, point);
                point_rows.push(PointInsert {
                    fp_hi: fp.hi,
                    fp_lo: fp.lo,
                    descriptor_id,
                    resource_id,
                    scope_id,
                    point,
                });
            }
        }

        let mut outcome = WriteOutcome::default();
        let mut tx = self.pool().begin().await?;

        for chunk in span_rows.chunks(INSERT_CHUNK) {
            outcome.merge(insert_spans(&mut tx, chunk).await?);
        }
        for chunk in log_rows.chunks(INSERT_CHUNK) {
            outcome.merge(insert_logs(&mut tx, chunk).await?);
        }
        for chunk in point_rows.chunks(INSERT_CHUNK) {
            outcome.merge(insert_points(&mut tx, chunk).await?);
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

async fn insert_spans(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    rows: &[SpanInsert<'_>],
) -> Result<WriteOutcome> {
    if rows.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO spans \
         (trace_id, span_id, parent_span_id, name, kind, start_unix_nanos, end_unix_nanos, \
          duration_nanos, status_code, status_message, resource_id, scope_id, service_id, \
          attrs, events, links) ",
    );
    qb.push_values(rows, |mut b, row| {
        let span = row.span;
        b.push_bind(span.trace_id.0.to_vec())
            .push_bind(span.span_id.0.to_vec())
            .push_bind(span.parent_span_id.map(|id| id.0.to_vec()))
            .push_bind(&span.name)
            .push_bind(span.kind.as_i16())
            .push_bind(span.start_unix_nanos)
            .push_bind(span.end_unix_nanos)
            .push_bind(span.duration_nanos())
            .push_bind(span.status_code.as_i16())
            .push_bind(span.status_message.as_deref())
            .push_bind(row.resource_id)
            .push_bind(row.scope_id)
            .push_bind(row.service_id)
            .push_bind(attrs_to_json(&span.attrs))
            .push_bind(events_json(span))
            .push_bind(links_json(span));
    });
    qb.push(" ON CONFLICT (trace_id, span_id) DO NOTHING");

    let inserted = qb.build().execute(&mut **tx).await?.rows_affected();
    Ok(WriteOutcome {
        inserted,
        duplicates: rows.len() as u64 - inserted,
    })
}

async fn insert_logs(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    rows: &[LogInsert<'_>],
) -> Result<WriteOutcome> {
    if rows.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO logs \
         (fp_hi, fp_lo, time_unix_nanos, observed_time_unix_nanos, severity_number, \
          severity_text, body, trace_id, span_id, resource_id, scope_id, service_id, attrs) ",
    );
    qb.push_values(rows, |mut b, row| {
        let log = row.log;
        b.push_bind(row.fp_hi)
            .push_bind(row.fp_lo)
            .push_bind(log.time_unix_nanos)
            .push_bind(log.observed_time_unix_nanos)
            .push_bind(log.severity_number as i16)
            .push_bind(&log.severity_text)
            .push_bind(log.body.to_json())
            .push_bind(log.trace_id.map(|id| id.0.to_vec()))
            .push_bind(log.span_id.map(|id| id.0.to_vec()))
            .push_bind(row.resource_id)
            .push_bind(row.scope_id)
            .push_bind(row.service_id)
            .push_bind(attrs_to_json(&log.attrs));
    });
    qb.push(" ON CONFLICT (fp_hi, fp_lo) DO NOTHING");

    let inserted = qb.build().execute(&mut **tx).await?.rows_affected();
    Ok(WriteOutcome {
        inserted,
        duplicates: rows.len() as u64 - inserted,
    })
}

async fn insert_points(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    rows: &[PointInsert<'_>],
) -> Result<WriteOutcome> {
    if rows.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO metric_points \
         (fp_hi, fp_lo, descriptor_id, resource_id, scope_id, time_unix_nanos, \
          start_time_unix_nanos, attrs, payload, value) ",
    );
    qb.push_values(rows, |mut b, row| {
        let point = row.point;
        b.push_bind(row.fp_hi)
            .push_bind(row.fp_lo)
            .push_bind(row.descriptor_id)
            .push_bind(row.resource_id)
            .push_bind(row.scope_id)
            .push_bind(point.time_unix_nanos)
            .push_bind(point.start_time_unix_nanos)
            .push_bind(attrs_to_json(&point.attrs))
            .push_bind(point.payload.to_json())
            .push_bind(point.payload.scalar());
    });
    qb.push(" ON CONFLICT (fp_hi, fp_lo) DO NOTHING");

    let inserted = qb.build().execute(&mut **tx).await?.rows_affected();
    Ok(WriteOutcome {
        inserted,
        duplicates: rows.len() as u64 - inserted,
    })
}

/// Idempotency key of a log record: timestamp, resource, body, attributes.
fn log_fingerprint(resource_id: i64, log: &LogRecord) -> crate::model::Fingerprint {
    let mut body_canonical = Vec::new();
    log.body.write_canonical(&mut body_canonical);
    FingerprintInput::new()
        .i64(log.time_unix_nanos)
        .i64(resource_id)
        .bytes(&body_canonical)
        .attrs(&log.attrs)
        .finish()
}

/// Idempotency key of a metric point: stream identity, timestamp,
/// attributes.
fn point_fingerprint(
    descriptor_id: i64,
    resource_id: i64,
    scope_id: i64,
    point: &MetricPoint,
) -> crate::model::Fingerprint {
    FingerprintInput::new()
        .i64(descriptor_id)
        .i64(resource_id)
        .i64(scope_id)
        .i64(point.time_unix_nanos)
        .attrs(&point.attrs)
        .finish()
}

fn events_json(span: &SpanRecord) -> serde_json::Value {
    serde_json::Value::Array(
        span.events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "time_unix_nanos": e.time_unix_nanos,
                    "name": e.name,
                    "attributes": attrs_to_json(&e.attrs),
                })
            })
            .collect(),
    )
}

fn links_json(span: &SpanRecord) -> serde_json::Value {
    serde_json::Value::Array(
        span.links
            .iter()
            .map(|l| {
                serde_json::json!({
                    "trace_id": l.trace_id.to_hex(),
                    "span_id": l.span_id.to_hex(),
                    "attributes": attrs_to_json(&l.attrs),
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::{AttrMap, Value};

    fn log(time: i64, body: &str) -> LogRecord {
        LogRecord {
            time_unix_nanos: time,
            observed_time_unix_nanos: None,
            severity_number: 9,
            severity_text: "INFO".into(),
            body: Value::String(body.into()),
            trace_id: None,
            span_id: None,
            attrs: AttrMap::new(),
        }
    }

    #[test]
    fn identical_logs_share_a_fingerprint() {
        let a = log(100, "hello");
        let b = log(100, "hello");
        assert_eq!(log_fingerprint(1, &a), log_fingerprint(1, &b));
    }

    #[test]
    fn log_fingerprint_varies_by_identity_fields() {
        let base = log(100, "hello");
        assert_ne!(log_fingerprint(1, &base), log_fingerprint(2, &base));
        assert_ne!(
            log_fingerprint(1, &base),
            log_fingerprint(1, &log(101, "hello"))
        );
        assert_ne!(
            log_fingerprint(1, &base),
            log_fingerprint(1, &log(100, "other"))
        );
    }

    #[test]
    fn log_fingerprint_ignores_severity() {
        // Identity is (timestamp, resource, body, attrs); severity is not
        // part of the key.
        let a = log(100, "hello");
        let mut b = log(100, "hello");
        b.severity_number = 17;
        assert_eq!(log_fingerprint(1, &a), log_fingerprint(1, &b));
    }

    #[test]
    fn point_fingerprint_varies_by_stream_and_time() {
        use crate::model::{MetricDescriptor, MetricKind, PointPayload, Temporality};
        let point = MetricPoint {
            descriptor: MetricDescriptor {
                name: "m".into(),
                kind: MetricKind::Gauge,
                unit: String::new(),
                temporality: Temporality::Unspecified,
                monotonic: false,
            },
            time_unix_nanos: 100,
            start_time_unix_nanos: None,
            attrs: AttrMap::new(),
            payload: PointPayload::Gauge { value: 1.0 },
        };
        let base = point_fingerprint(1, 1, 1, &point);
        assert_ne!(base, point_fingerprint(2, 1, 1, &point));
        let mut later = point.clone();
        later.time_unix_nanos = 101;
        assert_ne!(base, point_fingerprint(1, 1, 1, &later));
        // The payload value is NOT part of the key: a replayed point with a
        // different value is a duplicate drop, not an overwrite.
        let mut reval = point.clone();
        reval.payload = PointPayload::Gauge { value: 9.0 };
        assert_eq!(base, point_fingerprint(1, 1, 1, &reval));
    }
}
