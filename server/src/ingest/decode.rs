//! OTLP envelope decoding.
//!
//! Both transports target these functions: the gRPC services hand over the
//! prost request directly, the HTTP handlers first parse the body
//! (protobuf or JSON) into the same generated types. Items that fail
//! normalization are dropped here and counted for `partial_success`; a
//! malformed envelope never reaches this layer.

use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
use opentelemetry_proto::tonic::metrics::v1::{metric, number_data_point};
use opentelemetry_proto::tonic::resource::v1::Resource;

use super::normalize::{
    canon_time, canon_time_opt, clamp_severity, truncate_attrs, NormalizePolicy,
};
use crate::model::{
    attrs_from_otlp, LogGroup, LogRecord, MetricDescriptor, MetricGroup, MetricKind, MetricPoint,
    PointPayload, ResourceRecord, ScopeRecord, SpanEvent, SpanGroup, SpanId, SpanKind, SpanLink,
    SpanRecord, StatusCode, Temporality, TraceId, Value,
};

/// Decode output for one signal: the accepted groups plus rejection
/// accounting for the export response.
#[derive(Debug, Default)]
pub struct Decoded<G> {
    pub groups: Vec<G>,
    pub rejected: i64,
    /// First rejection reason, carried into `partial_success.error_message`.
    pub error_message: Option<String>,
}

impl<G> Decoded<G> {
    fn reject(&mut self, reason: &str) {
        self.rejected += 1;
        if self.error_message.is_none() {
            self.error_message = Some(reason.to_owned());
        }
    }
}

fn decode_resource(resource: Option<Resource>, policy: NormalizePolicy) -> ResourceRecord {
    let mut attrs = resource
        .map(|r| attrs_from_otlp(&r.attributes))
        .unwrap_or_default();
    truncate_attrs(&mut attrs, policy.max_attribute_bytes);
    ResourceRecord { attrs }
}

fn decode_scope(scope: Option<InstrumentationScope>, policy: NormalizePolicy) -> ScopeRecord {
    let scope = scope.unwrap_or_default();
    let mut attrs = attrs_from_otlp(&scope.attributes);
    truncate_attrs(&mut attrs, policy.max_attribute_bytes);
    ScopeRecord {
        name: scope.name,
        version: scope.version,
        attrs,
    }
}

// ============================================================================
// Traces
// ============================================================================

pub fn decode_traces(
    request: ExportTraceServiceRequest,
    policy: NormalizePolicy,
) -> Decoded<SpanGroup> {
    let mut out = Decoded::default();

    for resource_spans in request.resource_spans {
        let resource = decode_resource(resource_spans.resource, policy);

        for scope_spans in resource_spans.scope_spans {
            let scope = decode_scope(scope_spans.scope, policy);
            let mut spans = Vec::with_capacity(scope_spans.spans.len());

            for span in scope_spans.spans {
                let Some(trace_id) = TraceId::from_bytes(&span.trace_id) else {
                    out.reject("span trace_id must be 16 non-zero bytes");
                    continue;
                };
                let Some(span_id) = SpanId::from_bytes(&span.span_id) else {
                    out.reject("span span_id must be 8 non-zero bytes");
                    continue;
                };
                // Absent parents arrive as empty or zero-filled ids; any
                // other length is a malformed item.
                let parent_span_id = if span.parent_span_id.is_empty() {
                    None
                } else if span.parent_span_id.iter().all(|b| *b == 0)
                    && span.parent_span_id.len() == 8
                {
                    None
                } else {
                    match SpanId::from_bytes(&span.parent_span_id) {
                        Some(id) => Some(id),
                        None => {
                            out.reject("span parent_span_id must be 8 bytes");
                            continue;
                        }
                    }
                };
                let (Some(start), Some(end)) = (
                    canon_time(span.start_time_unix_nano),
                    canon_time(span.end_time_unix_nano),
                ) else {
                    out.reject("span timestamp out of range");
                    continue;
                };
                if end < start {
                    out.reject("span end before start");
                    continue;
                }

                let mut attrs = attrs_from_otlp(&span.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);

                let events = span
                    .events
                    .iter()
                    .filter_map(|e| {
                        let mut attrs = attrs_from_otlp(&e.attributes);
                        truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                        Some(SpanEvent {
                            time_unix_nanos: canon_time(e.time_unix_nano)?,
                            name: e.name.clone(),
                            attrs,
                        })
                    })
                    .collect();

                // Links with unusable ids are dropped individually; they do
                // not take the span with them.
                let links = span
                    .links
                    .iter()
                    .filter_map(|l| {
                        Some(SpanLink {
                            trace_id: TraceId::from_bytes(&l.trace_id)?,
                            span_id: SpanId::from_bytes(&l.span_id)?,
                            attrs: attrs_from_otlp(&l.attributes),
                        })
                    })
                    .collect();

                let (status_code, status_message) = span.status.map_or((StatusCode::Unset, None), |s| {
                    (
                        StatusCode::from_i32(s.code),
                        (!s.message.is_empty()).then_some(s.message),
                    )
                });

                spans.push(SpanRecord {
                    trace_id,
                    span_id,
                    parent_span_id,
                    name: span.name,
                    kind: SpanKind::from_i32(span.kind),
                    start_unix_nanos: start,
                    end_unix_nanos: end,
                    status_code,
                    status_message,
                    attrs,
                    events,
                    links,
                });
            }

            if !spans.is_empty() {
                out.groups.push(SpanGroup {
                    resource: resource.clone(),
                    scope,
                    spans,
                });
            }
        }
    }

    out
}

// ============================================================================
// Logs
// ============================================================================

pub fn decode_logs(
    request: ExportLogsServiceRequest,
    policy: NormalizePolicy,
) -> Decoded<LogGroup> {
    let mut out = Decoded::default();

    for resource_logs in request.resource_logs {
        let resource = decode_resource(resource_logs.resource, policy);

        for scope_logs in resource_logs.scope_logs {
            let scope = decode_scope(scope_logs.scope, policy);
            let mut logs = Vec::with_capacity(scope_logs.log_records.len());

            for record in scope_logs.log_records {
                // Event time falls back to observed time; a record with
                // neither cannot be placed on any timeline.
                let observed = canon_time_opt(record.observed_time_unix_nano);
                let time = match canon_time_opt(record.time_unix_nano).or(observed) {
                    Some(t) => t,
                    None => {
                        out.reject("log record has no usable timestamp");
                        continue;
                    }
                };

                let mut attrs = attrs_from_otlp(&record.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                let severity_number = clamp_severity(record.severity_number, &mut attrs);

                let mut body = record
                    .body
                    .as_ref()
                    .map_or_else(|| Value::String(String::new()), Value::from);
                body.truncate(policy.max_attribute_bytes);

                logs.push(LogRecord {
                    time_unix_nanos: time,
                    observed_time_unix_nanos: observed,
                    severity_number,
                    severity_text: record.severity_text,
                    body,
                    trace_id: TraceId::from_bytes(&record.trace_id),
                    span_id: SpanId::from_bytes(&record.span_id),
                    attrs,
                });
            }

            if !logs.is_empty() {
                out.groups.push(LogGroup {
                    resource: resource.clone(),
                    scope,
                    logs,
                });
            }
        }
    }

    out
}

// ============================================================================
// Metrics
// ============================================================================

pub fn decode_metrics(
    request: ExportMetricsServiceRequest,
    policy: NormalizePolicy,
) -> Decoded<MetricGroup> {
    let mut out = Decoded::default();

    for resource_metrics in request.resource_metrics {
        let resource = decode_resource(resource_metrics.resource, policy);

        for scope_metrics in resource_metrics.scope_metrics {
            let scope = decode_scope(scope_metrics.scope, policy);
            let mut points = Vec::new();

            for m in scope_metrics.metrics {
                let Some(data) = m.data else {
                    out.reject("metric carries no data");
                    continue;
                };
                decode_metric_data(&m.name, &m.unit, data, policy, &mut points, &mut out);
            }

            if !points.is_empty() {
                out.groups.push(MetricGroup {
                    resource: resource.clone(),
                    scope,
                    points,
                });
            }
        }
    }

    out
}

fn decode_metric_data(
    name: &str,
    unit: &str,
    data: metric::Data,
    policy: NormalizePolicy,
    points: &mut Vec<MetricPoint>,
    out: &mut Decoded<MetricGroup>,
) {
    let descriptor = |kind, temporality, monotonic| MetricDescriptor {
        name: name.to_owned(),
        kind,
        unit: unit.to_owned(),
        temporality,
        monotonic,
    };

    match data {
        metric::Data::Gauge(gauge) => {
            let desc = descriptor(MetricKind::Gauge, Temporality::Unspecified, false);
            for dp in gauge.data_points {
                let Some(time) = canon_time_opt(dp.time_unix_nano) else {
                    out.reject("gauge point has no timestamp");
                    continue;
                };
                let mut attrs = attrs_from_otlp(&dp.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                points.push(MetricPoint {
                    descriptor: desc.clone(),
                    time_unix_nanos: time,
                    start_time_unix_nanos: canon_time_opt(dp.start_time_unix_nano),
                    attrs,
                    payload: PointPayload::Gauge {
                        value: number_value(dp.value),
                    },
                });
            }
        }
        metric::Data::Sum(sum) => {
            let desc = descriptor(
                MetricKind::Sum,
                Temporality::from_i32(sum.aggregation_temporality),
                sum.is_monotonic,
            );
            for dp in sum.data_points {
                let Some(time) = canon_time_opt(dp.time_unix_nano) else {
                    out.reject("sum point has no timestamp");
                    continue;
                };
                let mut attrs = attrs_from_otlp(&dp.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                points.push(MetricPoint {
                    descriptor: desc.clone(),
                    time_unix_nanos: time,
                    start_time_unix_nanos: canon_time_opt(dp.start_time_unix_nano),
                    attrs,
                    payload: PointPayload::Sum {
                        value: number_value(dp.value),
                    },
                });
            }
        }
        metric::Data::Histogram(hist) => {
            let desc = descriptor(
                MetricKind::Histogram,
                Temporality::from_i32(hist.aggregation_temporality),
                false,
            );
            for dp in hist.data_points {
                let Some(time) = canon_time_opt(dp.time_unix_nano) else {
                    out.reject("histogram point has no timestamp");
                    continue;
                };
                // A histogram needs bucket_counts = bounds + 1; anything
                // else is uninterpretable.
                if dp.bucket_counts.len() != dp.explicit_bounds.len() + 1 {
                    out.reject("histogram bucket/bound arity mismatch");
                    continue;
                }
                let mut attrs = attrs_from_otlp(&dp.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                points.push(MetricPoint {
                    descriptor: desc.clone(),
                    time_unix_nanos: time,
                    start_time_unix_nanos: canon_time_opt(dp.start_time_unix_nano),
                    attrs,
                    payload: PointPayload::Histogram {
                        count: dp.count as i64,
                        sum: dp.sum,
                        bounds: dp.explicit_bounds,
                        counts: dp.bucket_counts.iter().map(|c| *c as i64).collect(),
                    },
                });
            }
        }
        metric::Data::ExponentialHistogram(hist) => {
            let desc = descriptor(
                MetricKind::ExponentialHistogram,
                Temporality::from_i32(hist.aggregation_temporality),
                false,
            );
            for dp in hist.data_points {
                let Some(time) = canon_time_opt(dp.time_unix_nano) else {
                    out.reject("exponential histogram point has no timestamp");
                    continue;
                };
                let mut attrs = attrs_from_otlp(&dp.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                let positive = dp.positive.unwrap_or_default();
                let negative = dp.negative.unwrap_or_default();
                points.push(MetricPoint {
                    descriptor: desc.clone(),
                    time_unix_nanos: time,
                    start_time_unix_nanos: canon_time_opt(dp.start_time_unix_nano),
                    attrs,
                    payload: PointPayload::ExponentialHistogram {
                        scale: dp.scale,
                        zero_count: dp.zero_count as i64,
                        positive_offset: positive.offset,
                        positive_counts: positive.bucket_counts.iter().map(|c| *c as i64).collect(),
                        negative_offset: negative.offset,
                        negative_counts: negative.bucket_counts.iter().map(|c| *c as i64).collect(),
                    },
                });
            }
        }
        metric::Data::Summary(summary) => {
            let desc = descriptor(MetricKind::Summary, Temporality::Unspecified, false);
            for dp in summary.data_points {
                let Some(time) = canon_time_opt(dp.time_unix_nano) else {
                    out.reject("summary point has no timestamp");
                    continue;
                };
                let mut attrs = attrs_from_otlp(&dp.attributes);
                truncate_attrs(&mut attrs, policy.max_attribute_bytes);
                points.push(MetricPoint {
                    descriptor: desc.clone(),
                    time_unix_nanos: time,
                    start_time_unix_nanos: canon_time_opt(dp.start_time_unix_nano),
                    attrs,
                    payload: PointPayload::Summary {
                        count: dp.count as i64,
                        sum: dp.sum,
                        quantiles: dp
                            .quantile_values
                            .iter()
                            .map(|q| (q.quantile, q.value))
                            .collect(),
                    },
                });
            }
        }
    }
}

fn number_value(value: Option<number_data_point::Value>) -> f64 {
    match value {
        Some(number_data_point::Value::AsDouble(d)) => d,
        Some(number_data_point::Value::AsInt(i)) => i as f64,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
    use opentelemetry_proto::tonic::logs::v1::{LogRecord as OtlpLogRecord, ResourceLogs, ScopeLogs};
    use opentelemetry_proto::tonic::metrics::v1::{
        Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
    };
    use opentelemetry_proto::tonic::trace::v1::{
        span, ResourceSpans, ScopeSpans, Span, Status,
    };

    const POLICY: NormalizePolicy = NormalizePolicy {
        max_attribute_bytes: 4096,
    };

    fn string_kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_owned(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_owned())),
            }),
        }
    }

    fn otlp_span(trace_id: Vec<u8>, span_id: Vec<u8>) -> Span {
        Span {
            trace_id,
            span_id,
            name: "op".into(),
            kind: span::SpanKind::Server as i32,
            start_time_unix_nano: 1_700_000_000_000_000_000,
            end_time_unix_nano: 1_700_000_000_250_000_000,
            status: Some(Status {
                code: 1,
                message: String::new(),
            }),
            ..Default::default()
        }
    }

    fn trace_request(spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![string_kv("service.name", "checkout")],
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans,
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        }
    }

    #[test]
    fn valid_span_is_decoded() {
        let decoded = decode_traces(trace_request(vec![otlp_span(vec![1; 16], vec![2; 8])]), POLICY);
        assert_eq!(decoded.rejected, 0);
        assert_eq!(decoded.groups.len(), 1);
        let group = &decoded.groups[0];
        assert_eq!(group.resource.service_name(), "checkout");
        assert_eq!(group.spans.len(), 1);
        let s = &group.spans[0];
        assert_eq!(s.duration_nanos(), 250_000_000);
        assert_eq!(s.kind, SpanKind::Server);
        assert_eq!(s.status_code, StatusCode::Ok);
    }

    #[test]
    fn nine_byte_span_id_is_rejected_others_survive() {
        let decoded = decode_traces(
            trace_request(vec![
                otlp_span(vec![1; 16], vec![2; 8]),
                otlp_span(vec![1; 16], vec![3; 9]),
                otlp_span(vec![1; 16], vec![4; 8]),
            ]),
            POLICY,
        );
        assert_eq!(decoded.rejected, 1);
        assert_eq!(decoded.groups[0].spans.len(), 2);
        assert!(decoded.error_message.unwrap().contains("span_id"));
    }

    #[test]
    fn zero_parent_means_root() {
        let mut span = otlp_span(vec![1; 16], vec![2; 8]);
        span.parent_span_id = vec![0; 8];
        let decoded = decode_traces(trace_request(vec![span]), POLICY);
        assert_eq!(decoded.groups[0].spans[0].parent_span_id, None);
    }

    #[test]
    fn end_before_start_is_rejected() {
        let mut span = otlp_span(vec![1; 16], vec![2; 8]);
        span.end_time_unix_nano = span.start_time_unix_nano - 1;
        let decoded = decode_traces(trace_request(vec![span]), POLICY);
        assert_eq!(decoded.rejected, 1);
        assert!(decoded.groups.is_empty());
    }

    #[test]
    fn log_time_falls_back_to_observed() {
        let request = ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                resource: None,
                scope_logs: vec![ScopeLogs {
                    scope: None,
                    log_records: vec![OtlpLogRecord {
                        observed_time_unix_nano: 42,
                        severity_number: 30, // out of range, clamps to 24
                        ..Default::default()
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        };
        let decoded = decode_logs(request, POLICY);
        assert_eq!(decoded.rejected, 0);
        let log = &decoded.groups[0].logs[0];
        assert_eq!(log.time_unix_nanos, 42);
        assert_eq!(log.severity_number, 24);
        assert_eq!(
            log.attrs[super::super::normalize::ORIGINAL_SEVERITY_KEY],
            Value::Int64(30)
        );
    }

    #[test]
    fn gauge_points_decode_with_descriptor() {
        let request = ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: None,
                scope_metrics: vec![ScopeMetrics {
                    scope: None,
                    metrics: vec![Metric {
                        name: "queue_depth".into(),
                        unit: "1".into(),
                        data: Some(metric::Data::Gauge(Gauge {
                            data_points: vec![NumberDataPoint {
                                time_unix_nano: 7,
                                value: Some(number_data_point::Value::AsInt(3)),
                                ..Default::default()
                            }],
                        })),
                        ..Default::default()
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        };
        let decoded = decode_metrics(request, POLICY);
        assert_eq!(decoded.rejected, 0);
        let point = &decoded.groups[0].points[0];
        assert_eq!(point.descriptor.name, "queue_depth");
        assert_eq!(point.descriptor.kind, MetricKind::Gauge);
        assert_eq!(point.payload, PointPayload::Gauge { value: 3.0 });
    }

    #[test]
    fn histogram_arity_mismatch_is_rejected() {
        use opentelemetry_proto::tonic::metrics::v1::{Histogram, HistogramDataPoint};
        let request = ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: None,
                scope_metrics: vec![ScopeMetrics {
                    scope: None,
                    metrics: vec![Metric {
                        name: "latency".into(),
                        data: Some(metric::Data::Histogram(Histogram {
                            data_points: vec![HistogramDataPoint {
                                time_unix_nano: 7,
                                count: 3,
                                bucket_counts: vec![1, 2], // needs 3 for 2 bounds
                                explicit_bounds: vec![1.0, 2.0],
                                ..Default::default()
                            }],
                            aggregation_temporality: 2,
                        })),
                        ..Default::default()
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        };
        let decoded = decode_metrics(request, POLICY);
        assert_eq!(decoded.rejected, 1);
        assert!(decoded.groups.is_empty());
    }
}
