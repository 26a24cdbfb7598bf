//! OTLP/gRPC export services.
//!
//! Three tonic services on a dedicated listener. Malformed protobuf never
//! reaches these handlers (tonic rejects it at the codec), so the handlers
//! only gate on schema readiness, decode, and wait for the commit.

use std::net::SocketAddr;
use std::sync::Arc;

use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsPartialSuccess, ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsPartialSuccess, ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use prost::Message;
use tonic::{Request, Response, Status};
use tracing::info;

use super::decode;
use super::{ExportReport, IngestPipeline};
use crate::schema::SchemaGate;

/// Shared state of the three OTLP services.
#[derive(Clone)]
pub struct OtlpGrpc {
    pipeline: Arc<IngestPipeline>,
    gate: SchemaGate,
}

impl OtlpGrpc {
    pub const fn new(pipeline: Arc<IngestPipeline>, gate: SchemaGate) -> Self {
        Self { pipeline, gate }
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpc {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.gate.check_writes().map_err(|e| e.to_status())?;
        let request = request.into_inner();
        let bytes = request.encoded_len();
        let decoded = decode::decode_traces(request, self.pipeline.normalize_policy());
        let report = self
            .pipeline
            .submit_spans(decoded, bytes)
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(ExportTraceServiceResponse {
            partial_success: trace_partial(&report),
        }))
    }
}

#[tonic::async_trait]
impl LogsService for OtlpGrpc {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        self.gate.check_writes().map_err(|e| e.to_status())?;
        let request = request.into_inner();
        let bytes = request.encoded_len();
        let decoded = decode::decode_logs(request, self.pipeline.normalize_policy());
        let report = self
            .pipeline
            .submit_logs(decoded, bytes)
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(ExportLogsServiceResponse {
            partial_success: logs_partial(&report),
        }))
    }
}

#[tonic::async_trait]
impl MetricsService for OtlpGrpc {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        self.gate.check_writes().map_err(|e| e.to_status())?;
        let request = request.into_inner();
        let bytes = request.encoded_len();
        let decoded = decode::decode_metrics(request, self.pipeline.normalize_policy());
        let report = self
            .pipeline
            .submit_metrics(decoded, bytes)
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(ExportMetricsServiceResponse {
            partial_success: metrics_partial(&report),
        }))
    }
}

/// `partial_success` is only present when something was actually dropped.
pub fn trace_partial(report: &ExportReport) -> Option<ExportTracePartialSuccess> {
    (report.rejected > 0).then(|| ExportTracePartialSuccess {
        rejected_spans: report.rejected,
        error_message: report.error_message.clone().unwrap_or_default(),
    })
}

pub fn logs_partial(report: &ExportReport) -> Option<ExportLogsPartialSuccess> {
    (report.rejected > 0).then(|| ExportLogsPartialSuccess {
        rejected_log_records: report.rejected,
        error_message: report.error_message.clone().unwrap_or_default(),
    })
}

pub fn metrics_partial(report: &ExportReport) -> Option<ExportMetricsPartialSuccess> {
    (report.rejected > 0).then(|| ExportMetricsPartialSuccess {
        rejected_data_points: report.rejected,
        error_message: report.error_message.clone().unwrap_or_default(),
    })
}

/// Serve the three OTLP services until shutdown.
pub async fn serve(
    addr: SocketAddr,
    pipeline: Arc<IngestPipeline>,
    gate: SchemaGate,
) -> anyhow::Result<()> {
    let state = OtlpGrpc::new(pipeline, gate);
    info!(%addr, "OTLP/gRPC listening");
    tonic::transport::Server::builder()
        .add_service(TraceServiceServer::new(state.clone()))
        .add_service(LogsServiceServer::new(state.clone()))
        .add_service(MetricsServiceServer::new(state))
        .serve(addr)
        .await?;
    Ok(())
}
