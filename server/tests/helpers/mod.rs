//! Shared test plumbing: an app router backed by a lazy pool.
//!
//! The pool never connects unless a handler actually reaches the database,
//! so everything in front of the store — routing, gating, decoding,
//! error mapping, the OpAMP coordinator — is exercised for real.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use lumen_server::api::{create_router, AppState};
use lumen_server::config::Config;
use lumen_server::ingest::IngestPipeline;
use lumen_server::opamp::AgentRegistry;
use lumen_server::schema::SchemaGate;
use lumen_server::store::Store;
use tower::ServiceExt;

pub fn test_app(gate: SchemaGate) -> Router {
    test_app_with_config(gate, Config::default_for_test())
}

pub fn test_app_with_config(gate: SchemaGate, config: Config) -> Router {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy(&config.database_url)
        .expect("lazy pool from test url");
    let store = Arc::new(Store::new(pool, &config));
    let ingest = Arc::new(IngestPipeline::new(&config));
    let opamp = Arc::new(AgentRegistry::new(config.opamp_pending_ttl));
    create_router(AppState::new(store, config, ingest, gate, opamp))
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone()
        .oneshot(request)
        .await
        .expect("router never errors")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes()
        .to_vec()
}
