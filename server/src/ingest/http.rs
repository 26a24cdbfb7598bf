//! OTLP/HTTP export handlers.
//!
//! `POST /v1/{traces,logs,metrics}` accepting `application/x-protobuf` and
//! `application/json` on the same paths. Both encodings parse into the same
//! generated request types, so everything from decode onward is shared with
//! the gRPC surface; the response mirrors the request's encoding.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::decode;
use super::grpc::{logs_partial, metrics_partial, trace_partial};
use crate::api::AppState;
use crate::error::{Error, Result};

const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";
const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Protobuf,
    Json,
}

fn request_encoding(headers: &HeaderMap) -> Result<Encoding> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    // Parameters like "; charset=utf-8" are legal on both types.
    let base = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        CONTENT_TYPE_PROTOBUF => Ok(Encoding::Protobuf),
        CONTENT_TYPE_JSON => Ok(Encoding::Json),
        other => Err(Error::invalid(format!(
            "unsupported content type: {other:?}"
        ))),
    }
}

fn parse_body<T>(encoding: Encoding, body: &Bytes) -> Result<T>
where
    T: Message + Default + DeserializeOwned,
{
    match encoding {
        Encoding::Protobuf => T::decode(body.as_ref())
            .map_err(|e| Error::invalid(format!("malformed protobuf envelope: {e}"))),
        Encoding::Json => serde_json::from_slice(body)
            .map_err(|e| Error::invalid(format!("malformed JSON envelope: {e}"))),
    }
}

fn encode_response<T>(encoding: Encoding, value: &T) -> Response
where
    T: Message + Serialize,
{
    match encoding {
        Encoding::Protobuf => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)],
            value.encode_to_vec(),
        )
            .into_response(),
        Encoding::Json => match serde_json::to_vec(value) {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
                body,
            )
                .into_response(),
            Err(e) => Error::fatal(format!("response serialization failed: {e}")).into_response(),
        },
    }
}

/// `POST /v1/traces`
pub async fn export_traces(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.schema.check_writes()?;
    let encoding = request_encoding(&headers)?;
    let request: ExportTraceServiceRequest = parse_body(encoding, &body)?;
    let decoded = decode::decode_traces(request, state.ingest.normalize_policy());
    let report = state.ingest.submit_spans(decoded, body.len()).await?;
    let response = ExportTraceServiceResponse {
        partial_success: trace_partial(&report),
    };
    Ok(encode_response(encoding, &response))
}

/// `POST /v1/logs`
pub async fn export_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.schema.check_writes()?;
    let encoding = request_encoding(&headers)?;
    let request: ExportLogsServiceRequest = parse_body(encoding, &body)?;
    let decoded = decode::decode_logs(request, state.ingest.normalize_policy());
    let report = state.ingest.submit_logs(decoded, body.len()).await?;
    let response = ExportLogsServiceResponse {
        partial_success: logs_partial(&report),
    };
    Ok(encode_response(encoding, &response))
}

/// `POST /v1/metrics`
pub async fn export_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.schema.check_writes()?;
    let encoding = request_encoding(&headers)?;
    let request: ExportMetricsServiceRequest = parse_body(encoding, &body)?;
    let decoded = decode::decode_metrics(request, state.ingest.normalize_policy());
    let report = state.ingest.submit_metrics(decoded, body.len()).await?;
    let response = ExportMetricsServiceResponse {
        partial_success: metrics_partial(&report),
    };
    Ok(encode_response(encoding, &response))
}
