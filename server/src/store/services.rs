//! Service catalog — RED metrics per service over a window.

use sqlx::FromRow;

use super::Store;
use crate::error::Result;

/// One service with its request/error/duration summary.
///
/// "Requests" are entry spans (Server/Consumer); services that only ever
/// issue calls (a front-end whose Client spans are trace roots) are counted
/// by their parentless spans instead, so they do not show up empty.
#[derive(Debug, Clone, FromRow)]
pub struct ServiceCatalogEntry {
    pub name: String,
    pub namespace: String,
    pub first_seen_unix_nanos: i64,
    pub last_seen_unix_nanos: i64,
    pub request_count: i64,
    pub error_count: i64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl ServiceCatalogEntry {
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

impl Store {
    /// Every service observed in the window, with RED metrics computed over
    /// its request spans. Percentiles come from `percentile_cont` and are
    /// reported in milliseconds.
    #[tracing::instrument(skip(self))]
    pub async fn list_services(
        &self,
        start_nanos: i64,
        end_nanos: i64,
    ) -> Result<Vec<ServiceCatalogEntry>> {
        let _permit = self.query_permit().await?;
        let start = self.clamp_to_horizon(start_nanos);

        let rows = sqlx::query_as(
            "SELECT svc.name, svc.namespace, \
                 svc.first_seen_unix_nanos, svc.last_seen_unix_nanos, \
                 COUNT(s.span_id) FILTER (WHERE s.kind IN (2, 5) OR s.parent_span_id IS NULL) \
                     AS request_count, \
                 COUNT(s.span_id) FILTER (WHERE (s.kind IN (2, 5) OR s.parent_span_id IS NULL) \
                     AND s.status_code = 2) AS error_count, \
                 percentile_cont(0.5) WITHIN GROUP (ORDER BY s.duration_nanos) \
                     FILTER (WHERE s.kind IN (2, 5) OR s.parent_span_id IS NULL) / 1e6 AS p50_ms, \
                 percentile_cont(0.95) WITHIN GROUP (ORDER BY s.duration_nanos) \
                     FILTER (WHERE s.kind IN (2, 5) OR s.parent_span_id IS NULL) / 1e6 AS p95_ms, \
                 percentile_cont(0.99) WITHIN GROUP (ORDER BY s.duration_nanos) \
                     FILTER (WHERE s.kind IN (2, 5) OR s.parent_span_id IS NULL) / 1e6 AS p99_ms \
             FROM services svc \
             LEFT JOIN spans s ON s.service_id = svc.id \
                 AND s.start_unix_nanos >= $1 AND s.start_unix_nanos <= $2 \
             GROUP BY svc.id, svc.name, svc.namespace, \
                 svc.first_seen_unix_nanos, svc.last_seen_unix_nanos \
             HAVING COUNT(s.span_id) > 0 \
                 OR (svc.last_seen_unix_nanos >= $1 AND svc.last_seen_unix_nanos <= $2) \
             ORDER BY svc.name, svc.namespace",
        )
        .bind(start)
        .bind(end_nanos)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_handles_zero_requests() {
        let entry = ServiceCatalogEntry {
            name: "idle".into(),
            namespace: String::new(),
            first_seen_unix_nanos: 0,
            last_seen_unix_nanos: 0,
            request_count: 0,
            error_count: 0,
            p50_ms: None,
            p95_ms: None,
            p99_ms: None,
        };
        assert_eq!(entry.error_rate(), 0.0);
    }

    #[test]
    fn error_rate_is_a_ratio() {
        let entry = ServiceCatalogEntry {
            name: "api".into(),
            namespace: String::new(),
            first_seen_unix_nanos: 0,
            last_seen_unix_nanos: 0,
            request_count: 200,
            error_count: 5,
            p50_ms: Some(12.0),
            p95_ms: Some(80.0),
            p99_ms: Some(230.0),
        };
        assert!((entry.error_rate() - 0.025).abs() < f64::EPSILON);
    }
}
