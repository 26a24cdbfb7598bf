//! OTLP/HTTP surface tests: content negotiation, malformed envelopes, and
//! normalize-stage partial success — everything in front of the store.

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use helpers::{body_bytes, body_json, send, test_app};
use lumen_server::schema::SchemaGate;
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use prost::Message;

fn otlp_span(trace_id: Vec<u8>, span_id: Vec<u8>) -> Span {
    Span {
        trace_id,
        span_id,
        name: "op".into(),
        kind: 2, // server
        start_time_unix_nano: 1_700_000_000_000_000_000,
        end_time_unix_nano: 1_700_000_000_250_000_000,
        ..Default::default()
    }
}

fn trace_request(spans: Vec<Span>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource::default()),
            scope_spans: vec![ScopeSpans {
                scope: None,
                spans,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }],
    }
}

fn protobuf_post(path: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/x-protobuf")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn unsupported_content_type_is_rejected() {
    let app = test_app(SchemaGate::open_for_test());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/traces")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "invalid_argument");
}

#[tokio::test]
async fn malformed_json_envelope_is_rejected() {
    let app = test_app(SchemaGate::open_for_test());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/logs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{broken"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_json_envelope_succeeds_without_partial_success() {
    let app = test_app(SchemaGate::open_for_test());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/traces")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body.get("partialSuccess").is_none());
}

#[tokio::test]
async fn invalid_span_ids_are_counted_in_partial_success() {
    let app = test_app(SchemaGate::open_for_test());
    // Three spans with 9-byte span ids: every item is rejected at
    // normalize, so nothing waits on the store and the response reports
    // the losses.
    let request = trace_request(vec![
        otlp_span(vec![1; 16], vec![2; 9]),
        otlp_span(vec![1; 16], vec![3; 9]),
        otlp_span(vec![1; 16], vec![4; 9]),
    ]);
    let response = send(
        &app,
        protobuf_post("/v1/traces", request.encode_to_vec()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let decoded =
        ExportTraceServiceResponse::decode(body_bytes(response).await.as_slice()).unwrap();
    let partial = decoded.partial_success.expect("partial success present");
    assert_eq!(partial.rejected_spans, 3);
    assert!(partial.error_message.contains("span_id"));
}

#[tokio::test]
async fn response_encoding_mirrors_request_encoding() {
    let app = test_app(SchemaGate::open_for_test());
    let response = send(
        &app,
        protobuf_post(
            "/v1/traces",
            ExportTraceServiceRequest::default().encode_to_vec(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/x-protobuf")
    );
}

#[tokio::test]
async fn commit_wait_times_out_as_unavailable_without_workers() {
    // A valid span with no batch worker running: the job is admitted but
    // never commits, so the handler returns Unavailable after the
    // admission timeout and the collector retries.
    let app = test_app(SchemaGate::open_for_test());
    let request = trace_request(vec![otlp_span(vec![1; 16], vec![2; 8])]);
    let response = send(
        &app,
        protobuf_post("/v1/traces", request.encode_to_vec()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
