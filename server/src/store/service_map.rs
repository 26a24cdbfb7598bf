//! Service-dependency map derivation.
//!
//! From the spans of a window, an edge `(caller, callee)` exists whenever a
//! Client/Producer span has a same-trace descendant Server/Consumer span in
//! another service, counted once per `(trace_id, edge)`. Descendant
//! resolution walks the parent chain of each entry span upward, so
//! intermediate Internal spans do not hide the relationship.
//!
//! Latency percentiles are exact up to a sample bound and switch to a
//! log-bucketed histogram with linear interpolation above it.

use std::collections::{HashMap, HashSet};

use sqlx::FromRow;

use super::Store;
use crate::error::Result;
use crate::model::SpanKind;

/// Span rows fetched for map derivation are capped; a window busier than
/// this yields a map over the newest spans and a warning.
const MAX_MAP_SPANS: i64 = 100_000;

/// Parent-chain walk bound; protects against cyclic parent links.
const MAX_ANCESTOR_DEPTH: usize = 128;

/// Exact percentile samples kept per node/edge before switching to the
/// histogram approximation.
const EXACT_SAMPLE_LIMIT: usize = 4096;

// ============================================================================
// Latency digest
// ============================================================================

const BUCKET_BASE: f64 = 1.25;
const BUCKET_COUNT: usize = 160;

/// Streaming latency summary: exact while small, log-bucketed above
/// [`EXACT_SAMPLE_LIMIT`]. Values are milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyDigest {
    count: u64,
    sum: f64,
    exact: Vec<f64>,
    buckets: Option<Vec<u64>>,
}

impl Default for LatencyDigest {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            exact: Vec::new(),
            buckets: None,
        }
    }
}

impl LatencyDigest {
    pub fn push(&mut self, value_ms: f64) {
        self.count += 1;
        self.sum += value_ms;
        match &mut self.buckets {
            Some(buckets) => buckets[bucket_index(value_ms)] += 1,
            None => {
                self.exact.push(value_ms);
                if self.exact.len() > EXACT_SAMPLE_LIMIT {
                    let mut buckets = vec![0u64; BUCKET_COUNT];
                    for v in self.exact.drain(..) {
                        buckets[bucket_index(v)] += 1;
                    }
                    self.buckets = Some(buckets);
                }
            }
        }
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Percentile in milliseconds. Exact (sorted, linearly interpolated)
    /// below the sample bound; bucket interpolation above it.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        if let Some(buckets) = &self.buckets {
            return percentile_from_buckets(buckets, self.count, p);
        }
        let mut sorted = self.exact.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let fraction = rank - lo as f64;
        Some(sorted[lo] + (sorted[hi] - sorted[lo]) * fraction)
    }
}

fn bucket_index(value_ms: f64) -> usize {
    if value_ms < 1.0 {
        return 0;
    }
    let idx = 1 + (value_ms.ln() / BUCKET_BASE.ln()).floor() as usize;
    idx.min(BUCKET_COUNT - 1)
}

/// Linear interpolation within the bucket containing the target rank;
/// empty buckets are skipped.
fn percentile_from_buckets(buckets: &[u64], count: u64, p: f64) -> Option<f64> {
    if count == 0 {
        return None;
    }
    let target = p.clamp(0.0, 1.0) * count as f64;
    let mut cumulative = 0u64;
    for (i, &bc) in buckets.iter().enumerate() {
        if bc == 0 {
            continue;
        }
        cumulative += bc;
        if cumulative as f64 > target {
            let lower = if i == 0 {
                0.0
            } else {
                BUCKET_BASE.powi(i as i32 - 1)
            };
            if i == buckets.len() - 1 {
                return Some(lower);
            }
            let upper = if i == 0 { 1.0 } else { BUCKET_BASE.powi(i as i32) };
            let before = cumulative - bc;
            let fraction = (target - before as f64) / bc as f64;
            return Some(fraction.mul_add(upper - lower, lower));
        }
    }
    None
}

// ============================================================================
// Map output
// ============================================================================

#[derive(Debug)]
pub struct ServiceMapNode {
    pub name: String,
    pub request_count: i64,
    pub error_count: i64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

#[derive(Debug)]
pub struct ServiceMapEdge {
    pub caller: String,
    pub callee: String,
    pub call_count: i64,
    pub error_count: i64,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Default)]
pub struct ServiceMap {
    pub nodes: Vec<ServiceMapNode>,
    pub edges: Vec<ServiceMapEdge>,
}

#[derive(Debug, FromRow)]
struct MapSpanRow {
    trace_id: Vec<u8>,
    span_id: Vec<u8>,
    parent_span_id: Option<Vec<u8>>,
    kind: i16,
    status_code: i16,
    duration_nanos: i64,
    service_name: String,
}

impl Store {
    /// Derive the service map for a window.
    #[tracing::instrument(skip(self))]
    pub async fn build_service_map(
        &self,
        start_nanos: i64,
        end_nanos: i64,
    ) -> Result<ServiceMap> {
        let _permit = self.query_permit().await?;
        let start = self.clamp_to_horizon(start_nanos);

        let rows: Vec<MapSpanRow> = sqlx::query_as(
            "SELECT s.trace_id, s.span_id, s.parent_span_id, s.kind, s.status_code, \
                 s.duration_nanos, svc.name AS service_name \
             FROM spans s JOIN services svc ON svc.id = s.service_id \
             WHERE s.start_unix_nanos >= $1 AND s.start_unix_nanos <= $2 \
             ORDER BY s.trace_id, s.start_unix_nanos DESC \
             LIMIT $3",
        )
        .bind(start)
        .bind(end_nanos)
        .bind(MAX_MAP_SPANS)
        .fetch_all(self.pool())
        .await?;

        if rows.len() as i64 == MAX_MAP_SPANS {
            tracing::warn!(
                cap = MAX_MAP_SPANS,
                "Service map window hit the span cap; map covers the newest spans only"
            );
        }

        Ok(derive_map(&rows))
    }
}

#[derive(Default)]
struct NodeStats {
    requests: i64,
    errors: i64,
    digest: LatencyDigest,
}

#[derive(Default)]
struct EdgeStats {
    calls: i64,
    errors: i64,
    digest: LatencyDigest,
}

fn derive_map(rows: &[MapSpanRow]) -> ServiceMap {
    let mut nodes: HashMap<&str, NodeStats> = HashMap::new();
    let mut edges: HashMap<(String, String), EdgeStats> = HashMap::new();

    // Rows are sorted by trace_id; walk each trace as one slice.
    let mut i = 0;
    while i < rows.len() {
        let mut j = i;
        while j < rows.len() && rows[j].trace_id == rows[i].trace_id {
            j += 1;
        }
        derive_trace(&rows[i..j], &mut edges);
        i = j;
    }

    // Node-level RED, independent of edge derivation.
    for row in rows {
        let stats = nodes.entry(row.service_name.as_str()).or_default();
        let kind = SpanKind::from_i16(row.kind);
        if kind.is_entry() || row.parent_span_id.is_none() {
            stats.requests += 1;
            if row.status_code == 2 {
                stats.errors += 1;
            }
            stats.digest.push(row.duration_nanos as f64 / 1e6);
        }
    }

    let mut map = ServiceMap {
        nodes: nodes
            .into_iter()
            .map(|(name, stats)| ServiceMapNode {
                name: name.to_owned(),
                request_count: stats.requests,
                error_count: stats.errors,
                p50_ms: stats.digest.percentile(0.50),
                p95_ms: stats.digest.percentile(0.95),
                p99_ms: stats.digest.percentile(0.99),
            })
            .collect(),
        edges: edges
            .into_iter()
            .map(|((caller, callee), stats)| ServiceMapEdge {
                caller,
                callee,
                call_count: stats.calls,
                error_count: stats.errors,
                avg_latency_ms: stats.digest.mean(),
            })
            .collect(),
    };
    map.nodes.sort_by(|a, b| a.name.cmp(&b.name));
    map.edges
        .sort_by(|a, b| (&a.caller, &a.callee).cmp(&(&b.caller, &b.callee)));
    map
}

/// Find caller→callee pairs within one trace. For every entry span, walk
/// its ancestor chain to the nearest exit span in a different service.
fn derive_trace(trace: &[MapSpanRow], edges: &mut HashMap<(String, String), EdgeStats>) {
    let by_id: HashMap<&[u8], &MapSpanRow> =
        trace.iter().map(|s| (s.span_id.as_slice(), s)).collect();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();

    for entry in trace {
        if !SpanKind::from_i16(entry.kind).is_entry() {
            continue;
        }
        let mut parent = entry.parent_span_id.as_deref();
        for _ in 0..MAX_ANCESTOR_DEPTH {
            let Some(parent_id) = parent else { break };
            let Some(ancestor) = by_id.get(parent_id) else {
                break;
            };
            if SpanKind::from_i16(ancestor.kind).is_exit()
                && ancestor.service_name != entry.service_name
            {
                // Once per (trace, edge): the first entry span to surface a
                // caller/callee pair contributes its sample.
                if seen.insert((&ancestor.service_name, &entry.service_name)) {
                    let stats = edges
                        .entry((
                            ancestor.service_name.clone(),
                            entry.service_name.clone(),
                        ))
                        .or_default();
                    stats.calls += 1;
                    if entry.status_code == 2 || ancestor.status_code == 2 {
                        stats.errors += 1;
                    }
                    stats.digest.push(ancestor.duration_nanos as f64 / 1e6);
                }
                break;
            }
            parent = ancestor.parent_span_id.as_deref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        trace: u8,
        span: u8,
        parent: Option<u8>,
        kind: SpanKind,
        status: i16,
        duration_ms: i64,
        service: &str,
    ) -> MapSpanRow {
        MapSpanRow {
            trace_id: vec![trace; 16],
            span_id: vec![span; 8],
            parent_span_id: parent.map(|p| vec![p; 8]),
            kind: kind.as_i16(),
            status_code: status,
            duration_nanos: duration_ms * 1_000_000,
            service_name: service.into(),
        }
    }

    #[test]
    fn two_hop_chain_yields_two_edges() {
        // trace A: web(client) -> api(server); trace B: api(client) -> db(server)
        let rows = vec![
            row(1, 1, None, SpanKind::Client, 0, 10, "web"),
            row(1, 2, Some(1), SpanKind::Server, 0, 8, "api"),
            row(2, 3, None, SpanKind::Client, 0, 5, "api"),
            row(2, 4, Some(3), SpanKind::Server, 0, 4, "db"),
        ];
        let map = derive_map(&rows);
        let names: Vec<&str> = map.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "web"]);
        assert_eq!(map.edges.len(), 2);
        assert_eq!(map.edges[0].caller, "api");
        assert_eq!(map.edges[0].callee, "db");
        assert_eq!(map.edges[0].call_count, 1);
        assert_eq!(map.edges[1].caller, "web");
        assert_eq!(map.edges[1].callee, "api");
        assert_eq!(map.edges[1].call_count, 1);
    }

    #[test]
    fn internal_spans_do_not_hide_the_edge() {
        // web client -> web internal -> api server
        let rows = vec![
            row(1, 1, None, SpanKind::Client, 0, 10, "web"),
            row(1, 2, Some(1), SpanKind::Internal, 0, 9, "web"),
            row(1, 3, Some(2), SpanKind::Server, 0, 8, "api"),
        ];
        let map = derive_map(&rows);
        assert_eq!(map.edges.len(), 1);
        assert_eq!(map.edges[0].caller, "web");
        assert_eq!(map.edges[0].callee, "api");
    }

    #[test]
    fn edge_counted_once_per_trace() {
        // Two api server spans under the same web client in one trace:
        // still one call on the edge.
        let rows = vec![
            row(1, 1, None, SpanKind::Client, 0, 10, "web"),
            row(1, 2, Some(1), SpanKind::Server, 0, 4, "api"),
            row(1, 3, Some(1), SpanKind::Server, 0, 5, "api"),
        ];
        let map = derive_map(&rows);
        assert_eq!(map.edges.len(), 1);
        assert_eq!(map.edges[0].call_count, 1);
    }

    #[test]
    fn same_service_calls_are_not_edges() {
        let rows = vec![
            row(1, 1, None, SpanKind::Client, 0, 10, "api"),
            row(1, 2, Some(1), SpanKind::Server, 0, 8, "api"),
        ];
        let map = derive_map(&rows);
        assert!(map.edges.is_empty());
    }

    #[test]
    fn edge_error_counts_either_endpoint() {
        let rows = vec![
            row(1, 1, None, SpanKind::Client, 0, 10, "web"),
            row(1, 2, Some(1), SpanKind::Server, 2, 8, "api"),
        ];
        let map = derive_map(&rows);
        assert_eq!(map.edges[0].error_count, 1);
    }

    #[test]
    fn cyclic_parent_links_terminate() {
        // a and b are each other's parent
        let a = row(1, 1, Some(2), SpanKind::Client, 0, 10, "web");
        let b = row(1, 2, Some(1), SpanKind::Server, 0, 8, "api");
        let map = derive_map(&[a, b]);
        // The walk must not hang; edge derivation still works.
        assert_eq!(map.edges.len(), 1);
    }

    #[test]
    fn digest_exact_percentiles() {
        let mut digest = LatencyDigest::default();
        for v in 1..=100 {
            digest.push(f64::from(v));
        }
        let p50 = digest.percentile(0.50).unwrap();
        assert!((p50 - 50.5).abs() < 1.0, "p50={p50}");
        let p99 = digest.percentile(0.99).unwrap();
        assert!(p99 > 98.0, "p99={p99}");
        assert_eq!(digest.mean(), Some(50.5));
    }

    #[test]
    fn digest_switches_to_buckets_past_limit() {
        let mut digest = LatencyDigest::default();
        for _ in 0..(EXACT_SAMPLE_LIMIT + 100) {
            digest.push(10.0);
        }
        assert!(digest.buckets.is_some());
        let p50 = digest.percentile(0.50).unwrap();
        // 10 ms falls in the bucket [1.25^10, 1.25^11) ≈ [9.3, 11.6)
        assert!((5.0..20.0).contains(&p50), "p50={p50}");
    }

    #[test]
    fn empty_digest_has_no_percentiles() {
        let digest = LatencyDigest::default();
        assert_eq!(digest.percentile(0.5), None);
        assert_eq!(digest.mean(), None);
    }
}
