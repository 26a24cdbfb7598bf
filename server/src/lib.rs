//! Lumen Server
//!
//! Self-hosted observability backend: OTLP ingestion (gRPC + HTTP) into a
//! `PostgreSQL` star schema, an interactive query API, and an OpAMP
//! coordinator for remote collector configuration.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod opamp;
pub mod schema;
pub mod store;
