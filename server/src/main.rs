//! Lumen Server - Main Entry Point
//!
//! Startup ordering: tracing → config → database pool → schema coordinator
//! (spawned; writes stay gated until the version requirement is met) →
//! store + ingest workers + retention → OTLP/gRPC and HTTP listeners.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use lumen_server::api;
use lumen_server::config::Config;
use lumen_server::ingest::{grpc, IngestPipeline};
use lumen_server::opamp::{self, AgentRegistry};
use lumen_server::schema;
use lumen_server::store::{self, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumen_server=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Lumen Server"
    );

    // Initialize database
    let pool = store::create_pool(&config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to database: {e}"))?;

    // Exactly one process in the fleet runs migrations; everyone else polls
    // the version. Serving starts immediately — the gate keeps writes (and
    // early reads) out until the schema is ready.
    let (schema_gate, _coordinator) = schema::spawn_coordinator(
        pool.clone(),
        config.schema_required_version,
        config.schema_required_version_read_only,
    );

    let store = Arc::new(Store::new(pool.clone(), &config));
    let ingest = Arc::new(IngestPipeline::new(&config));
    let _workers = ingest.spawn_workers(Arc::clone(&store));
    let _retention = store::spawn_retention_task(pool, config.retention_horizon);

    let opamp_registry = Arc::new(AgentRegistry::new(config.opamp_pending_ttl));
    let _sweeper = opamp::spawn_sweeper(Arc::clone(&opamp_registry));

    // OTLP/gRPC on its own listener
    let grpc_addr: SocketAddr = config
        .otlp_grpc_address
        .parse()
        .context("OTLP_GRPC_ADDRESS must be a socket address")?;
    let grpc_server = tokio::spawn(grpc::serve(
        grpc_addr,
        Arc::clone(&ingest),
        schema_gate.clone(),
    ));

    // HTTP: OTLP, query API, OpAMP
    let state = api::AppState::new(
        store,
        config.clone(),
        ingest,
        schema_gate,
        opamp_registry,
    );
    let app = api::create_router(state);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .context("BIND_ADDRESS must be a socket address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("HTTP server exited")?;
        }
        result = grpc_server => {
            result.context("gRPC task panicked")??;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
