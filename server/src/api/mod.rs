//! API Router and Application State
//!
//! Central routing configuration and shared state.

pub mod envelope;
pub mod health;
pub mod logs;
pub mod metrics;
pub mod services;
pub mod spans;
pub mod traces;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{http as otlp_http, IngestPipeline};
use crate::opamp::{rest as opamp_rest, ws as opamp_ws, AgentRegistry};
use crate::schema::SchemaGate;
use crate::store::Store;

/// OTLP/HTTP bodies can be large; cap them well below anything that would
/// destabilize the process.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Storage layer
    pub store: Arc<Store>,
    /// Server configuration
    pub config: Arc<Config>,
    /// Ingestion pipeline (admission queues + policies)
    pub ingest: Arc<IngestPipeline>,
    /// Schema version gate
    pub schema: SchemaGate,
    /// OpAMP agent registry
    pub opamp: Arc<AgentRegistry>,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        config: Config,
        ingest: Arc<IngestPipeline>,
        schema: SchemaGate,
        opamp: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            ingest,
            schema,
            opamp,
        }
    }
}

/// Run a query future under the configured per-query deadline.
///
/// Elapsing maps to `Cancelled`; dropping the future cancels the in-flight
/// statement at the driver level, so a cancelled request issues no further
/// database work.
pub async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Cancelled),
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.cors_allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| {
                if let Ok(origin) = o.parse() {
                    Some(origin)
                } else {
                    tracing::warn!(origin = %o, "Invalid CORS origin in configuration, skipping");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // OTLP/HTTP ingestion
        .route("/v1/traces", post(otlp_http::export_traces))
        .route("/v1/logs", post(otlp_http::export_logs))
        .route("/v1/metrics", post(otlp_http::export_metrics))
        // OpAMP transport + REST facade
        .route("/v1/opamp", any(opamp_ws::opamp_ws))
        .route("/api/opamp/status", get(opamp_rest::status))
        .route(
            "/api/opamp/config",
            get(opamp_rest::get_config).post(opamp_rest::post_config),
        )
        .route("/api/opamp/health", get(opamp_rest::health))
        // Query API
        .route("/api/traces/search", get(traces::search))
        .route("/api/traces/{trace_id}", get(traces::detail))
        .route("/api/spans/search", post(spans::search))
        .route("/api/logs/search", get(logs::search))
        .route("/api/metrics/search", get(metrics::search))
        .route("/api/services", get(services::list))
        .route("/api/service-map", post(services::service_map))
        // Health
        .route("/health", get(health::health))
        .route("/health/db", get(health::health_db))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
        .with_state(state)
}
