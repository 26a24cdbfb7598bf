//! Canonical data model: dynamic attribute values, content fingerprints,
//! and protocol-neutral telemetry records.

pub mod fingerprint;
pub mod telemetry;
pub mod value;

pub use fingerprint::{Fingerprint, FingerprintInput};
pub use telemetry::{
    LogGroup, LogRecord, MetricDescriptor, MetricGroup, MetricKind, MetricPoint, PointPayload,
    ResourceRecord, ScopeRecord, SpanEvent, SpanGroup, SpanId, SpanKind, SpanLink, SpanRecord,
    StatusCode, Temporality, TraceId,
};
pub use value::{attrs_from_otlp, attrs_to_json, AttrMap, Value};
