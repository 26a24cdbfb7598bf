//! Protocol-neutral telemetry records.
//!
//! Both OTLP decoders (protobuf and JSON) produce these types; everything
//! downstream of decode — normalization, batching, storage — is
//! encoding-agnostic. The grouping mirrors the OTLP envelope
//! (resource → scope → items) because that is also the shape the star
//! schema wants: dimensions once per group, facts per item.

use serde::Serialize;

use super::value::{AttrMap, Value};

// ============================================================================
// Identifiers
// ============================================================================

/// A 16-byte trace identifier. Zero-filled ids are invalid and never
/// constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub [u8; 16]);

/// An 8-byte span identifier. Zero-filled ids are invalid and never
/// constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(pub [u8; 8]);

impl TraceId {
    /// Parse from raw OTLP bytes. `None` when the length is wrong or the id
    /// is all zeroes (which OTLP treats as absent).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        if arr == [0u8; 16] {
            return None;
        }
        Some(Self(arr))
    }

    /// Parse from a 32-character lowercase/uppercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut arr = [0u8; 16];
        hex::decode_to_slice(s, &mut arr).ok()?;
        if arr == [0u8; 16] {
            return None;
        }
        Some(Self(arr))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl SpanId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        if arr == [0u8; 8] {
            return None;
        }
        Some(Self(arr))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut arr = [0u8; 8];
        hex::decode_to_slice(s, &mut arr).ok()?;
        if arr == [0u8; 8] {
            return None;
        }
        Some(Self(arr))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

// ============================================================================
// Enumerations
// ============================================================================

/// OTLP span kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub const fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Internal,
            2 => Self::Server,
            3 => Self::Client,
            4 => Self::Producer,
            5 => Self::Consumer,
            _ => Self::Unspecified,
        }
    }

    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Unspecified => 0,
            Self::Internal => 1,
            Self::Server => 2,
            Self::Client => 3,
            Self::Producer => 4,
            Self::Consumer => 5,
        }
    }

    pub const fn from_i16(v: i16) -> Self {
        Self::from_i32(v as i32)
    }

    /// Kinds that represent handling a request (the callee side).
    pub const fn is_entry(self) -> bool {
        matches!(self, Self::Server | Self::Consumer)
    }

    /// Kinds that represent issuing a request (the caller side).
    pub const fn is_exit(self) -> bool {
        matches!(self, Self::Client | Self::Producer)
    }
}

/// OTLP span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub const fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Ok,
            2 => Self::Error,
            _ => Self::Unset,
        }
    }

    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Unset => 0,
            Self::Ok => 1,
            Self::Error => 2,
        }
    }

    pub const fn from_i16(v: i16) -> Self {
        Self::from_i32(v as i32)
    }
}

/// Metric instrument kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Sum,
    Histogram,
    ExponentialHistogram,
    Summary,
}

impl MetricKind {
    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Gauge => 0,
            Self::Sum => 1,
            Self::Histogram => 2,
            Self::ExponentialHistogram => 3,
            Self::Summary => 4,
        }
    }

    pub const fn from_i16(v: i16) -> Self {
        match v {
            1 => Self::Sum,
            2 => Self::Histogram,
            3 => Self::ExponentialHistogram,
            4 => Self::Summary,
            _ => Self::Gauge,
        }
    }
}

/// Aggregation temporality of a Sum/Histogram stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Temporality {
    Unspecified,
    Delta,
    Cumulative,
}

impl Temporality {
    pub const fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Delta,
            2 => Self::Cumulative,
            _ => Self::Unspecified,
        }
    }

    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Unspecified => 0,
            Self::Delta => 1,
            Self::Cumulative => 2,
        }
    }
}

// ============================================================================
// Dimensions (pre-resolution)
// ============================================================================

/// A resource as decoded from the wire, before dimension resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceRecord {
    pub attrs: AttrMap,
}

impl ResourceRecord {
    pub fn service_name(&self) -> &str {
        self.attrs
            .get("service.name")
            .and_then(Value::as_str)
            .unwrap_or("unknown_service")
    }

    pub fn service_namespace(&self) -> &str {
        self.attrs
            .get("service.namespace")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// An instrumentation scope as decoded from the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeRecord {
    pub name: String,
    pub version: String,
    pub attrs: AttrMap,
}

impl ScopeRecord {
    /// The attribute map that drives the scope fingerprint. Name and
    /// version participate as reserved keys so that two scopes with equal
    /// attributes but different identities stay distinct.
    pub fn fingerprint_attrs(&self) -> AttrMap {
        let mut map = self.attrs.clone();
        map.insert("otel.scope.name".into(), Value::String(self.name.clone()));
        map.insert(
            "otel.scope.version".into(),
            Value::String(self.version.clone()),
        );
        map
    }
}

/// Descriptor identity of a metric stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDescriptor {
    pub name: String,
    pub kind: MetricKind,
    pub unit: String,
    pub temporality: Temporality,
    pub monotonic: bool,
}

impl MetricDescriptor {
    /// The attribute map that drives the descriptor fingerprint.
    pub fn fingerprint_attrs(&self) -> AttrMap {
        let mut map = AttrMap::new();
        map.insert("name".into(), Value::String(self.name.clone()));
        map.insert("kind".into(), Value::Int64(i64::from(self.kind.as_i16())));
        map.insert("unit".into(), Value::String(self.unit.clone()));
        map.insert(
            "temporality".into(),
            Value::Int64(i64::from(self.temporality.as_i16())),
        );
        map.insert("monotonic".into(), Value::Bool(self.monotonic));
        map
    }
}

// ============================================================================
// Facts
// ============================================================================

/// A point-in-time event attached to a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub time_unix_nanos: i64,
    pub name: String,
    pub attrs: AttrMap,
}

/// A link from a span to another span, possibly in another trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub attrs: AttrMap,
}

/// A single span, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_unix_nanos: i64,
    pub end_unix_nanos: i64,
    pub status_code: StatusCode,
    pub status_message: Option<String>,
    pub attrs: AttrMap,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
}

impl SpanRecord {
    /// Duration is derived, never stored independently.
    pub const fn duration_nanos(&self) -> i64 {
        self.end_unix_nanos - self.start_unix_nanos
    }
}

/// A single log record, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub time_unix_nanos: i64,
    pub observed_time_unix_nanos: Option<i64>,
    pub severity_number: i32,
    pub severity_text: String,
    pub body: Value,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
    pub attrs: AttrMap,
}

/// The kind-specific payload of a metric data point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointPayload {
    Gauge {
        value: f64,
    },
    Sum {
        value: f64,
    },
    Histogram {
        count: i64,
        sum: Option<f64>,
        bounds: Vec<f64>,
        counts: Vec<i64>,
    },
    ExponentialHistogram {
        scale: i32,
        zero_count: i64,
        positive_offset: i32,
        positive_counts: Vec<i64>,
        negative_offset: i32,
        negative_counts: Vec<i64>,
    },
    Summary {
        count: i64,
        sum: f64,
        quantiles: Vec<(f64, f64)>,
    },
}

impl PointPayload {
    /// JSONB storage form of the payload.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Gauge { value } | Self::Sum { value } => serde_json::json!({ "value": value }),
            Self::Histogram {
                count,
                sum,
                bounds,
                counts,
            } => serde_json::json!({
                "count": count,
                "sum": sum,
                "bounds": bounds,
                "counts": counts,
            }),
            Self::ExponentialHistogram {
                scale,
                zero_count,
                positive_offset,
                positive_counts,
                negative_offset,
                negative_counts,
            } => serde_json::json!({
                "scale": scale,
                "zero_count": zero_count,
                "positive": { "offset": positive_offset, "counts": positive_counts },
                "negative": { "offset": negative_offset, "counts": negative_counts },
            }),
            Self::Summary {
                count,
                sum,
                quantiles,
            } => serde_json::json!({
                "count": count,
                "sum": sum,
                "quantiles": quantiles
                    .iter()
                    .map(|(q, v)| serde_json::json!({ "quantile": q, "value": v }))
                    .collect::<Vec<_>>(),
            }),
        }
    }

    /// A scalar representation for search responses: the point value for
    /// gauges/sums, the mean for histograms and summaries.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Self::Gauge { value } | Self::Sum { value } => Some(*value),
            Self::Histogram { count, sum, .. } => {
                sum.filter(|_| *count > 0).map(|s| s / *count as f64)
            }
            Self::Summary { count, sum, .. } => {
                (*count > 0).then(|| *sum / *count as f64)
            }
            Self::ExponentialHistogram { .. } => None,
        }
    }
}

/// A single metric data point, normalized, carrying its descriptor identity.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub descriptor: MetricDescriptor,
    pub time_unix_nanos: i64,
    pub start_time_unix_nanos: Option<i64>,
    pub attrs: AttrMap,
    pub payload: PointPayload,
}

// ============================================================================
// Batch containers
// ============================================================================

/// Spans sharing one resource and scope.
#[derive(Debug, Clone, Default)]
pub struct SpanGroup {
    pub resource: ResourceRecord,
    pub scope: ScopeRecord,
    pub spans: Vec<SpanRecord>,
}

/// Log records sharing one resource and scope.
#[derive(Debug, Clone, Default)]
pub struct LogGroup {
    pub resource: ResourceRecord,
    pub scope: ScopeRecord,
    pub logs: Vec<LogRecord>,
}

/// Metric points sharing one resource and scope.
#[derive(Debug, Clone, Default)]
pub struct MetricGroup {
    pub resource: ResourceRecord,
    pub scope: ScopeRecord,
    pub points: Vec<MetricPoint>,
}

/// An item count over a set of groups, used for batch sizing and
/// partial-success accounting.
pub trait ItemCount {
    fn item_count(&self) -> usize;
}

impl ItemCount for SpanGroup {
    fn item_count(&self) -> usize {
        self.spans.len()
    }
}

impl ItemCount for LogGroup {
    fn item_count(&self) -> usize {
        self.logs.len()
    }
}

impl ItemCount for MetricGroup {
    fn item_count(&self) -> usize {
        self.points.len()
    }
}

pub fn total_items<G: ItemCount>(groups: &[G]) -> usize {
    groups.iter().map(ItemCount::item_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ids_are_absent() {
        assert!(TraceId::from_bytes(&[0u8; 16]).is_none());
        assert!(SpanId::from_bytes(&[0u8; 8]).is_none());
    }

    #[test]
    fn wrong_length_ids_are_rejected() {
        assert!(TraceId::from_bytes(&[1u8; 15]).is_none());
        assert!(TraceId::from_bytes(&[1u8; 17]).is_none());
        assert!(SpanId::from_bytes(&[1u8; 9]).is_none());
    }

    #[test]
    fn hex_roundtrip() {
        let id = TraceId::from_hex("0102030405060708090a0b0c0d0e0f10").unwrap();
        assert_eq!(id.to_hex(), "0102030405060708090a0b0c0d0e0f10");
        let sid = SpanId::from_hex("aabbccddeeff0108").unwrap();
        assert_eq!(sid.to_hex(), "aabbccddeeff0108");
    }

    #[test]
    fn span_kind_i16_roundtrip() {
        for v in 0..=5 {
            let kind = SpanKind::from_i32(v);
            assert_eq!(SpanKind::from_i16(kind.as_i16()), kind);
        }
    }

    #[test]
    fn duration_is_derived() {
        let span = SpanRecord {
            trace_id: TraceId([1; 16]),
            span_id: SpanId([2; 8]),
            parent_span_id: None,
            name: "op".into(),
            kind: SpanKind::Server,
            start_unix_nanos: 1_700_000_000_000_000_000,
            end_unix_nanos: 1_700_000_000_250_000_000,
            status_code: StatusCode::Ok,
            status_message: None,
            attrs: AttrMap::new(),
            events: vec![],
            links: vec![],
        };
        assert_eq!(span.duration_nanos(), 250_000_000);
    }

    #[test]
    fn scope_identity_reaches_fingerprint_attrs() {
        let a = ScopeRecord {
            name: "lib".into(),
            version: "1".into(),
            attrs: AttrMap::new(),
        };
        let b = ScopeRecord {
            name: "lib".into(),
            version: "2".into(),
            attrs: AttrMap::new(),
        };
        assert_ne!(a.fingerprint_attrs(), b.fingerprint_attrs());
    }

    #[test]
    fn histogram_scalar_is_mean() {
        let p = PointPayload::Histogram {
            count: 4,
            sum: Some(10.0),
            bounds: vec![1.0],
            counts: vec![2, 2],
        };
        assert_eq!(p.scalar(), Some(2.5));
    }
}
