//! Server Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address: OTLP/HTTP, query API, OpAMP (e.g., "0.0.0.0:4318")
    pub bind_address: String,

    /// OTLP/gRPC bind address (e.g., "0.0.0.0:4317")
    pub otlp_grpc_address: String,

    /// `PostgreSQL` connection URL
    pub database_url: String,

    /// Connection pool sizing
    pub database_pool_min: u32,
    pub database_pool_max: u32,

    /// Batching thresholds: a batch flushes when any of these is reached
    pub ingest_batch_max_items: usize,
    pub ingest_batch_max_bytes: usize,
    pub ingest_batch_max_delay: Duration,

    /// Admission queue shape (per signal)
    pub ingest_queue_capacity: usize,
    pub ingest_queue_highwater: usize,

    /// Bounded retries for retryable write errors
    pub ingest_batch_retries: u32,

    /// How long an export handler waits for its batch to commit
    pub ingest_admission_timeout: Duration,

    /// Attribute values larger than this are truncated at normalize
    pub ingest_max_attribute_bytes: usize,

    /// Default per-query server deadline
    pub query_deadline: Duration,

    /// Oldest admissible row age; retention deletes and queries clamp to it
    pub retention_horizon: Duration,

    /// Minimum schema version to serve writes (default: latest known)
    pub schema_required_version: i64,

    /// Minimum schema version to serve reads
    pub schema_required_version_read_only: i64,

    /// How long a pending OpAMP config (and disconnected agent state) is kept
    pub opamp_pending_ttl: Duration,

    /// Allowed CORS origins ("*" = any)
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:4318".into()),
            otlp_grpc_address: env::var("OTLP_GRPC_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:4317".into()),
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_pool_min: parse_or("DATABASE_POOL_MIN", 2),
            database_pool_max: parse_or("DATABASE_POOL_MAX", 20),
            ingest_batch_max_items: parse_or("INGEST_BATCH_MAX_ITEMS", 512),
            ingest_batch_max_bytes: parse_or("INGEST_BATCH_MAX_BYTES", 1024 * 1024),
            ingest_batch_max_delay: Duration::from_millis(parse_or(
                "INGEST_BATCH_MAX_DELAY_MS",
                200,
            )),
            ingest_queue_capacity: parse_or("INGEST_QUEUE_CAPACITY", 1024),
            ingest_queue_highwater: parse_or("INGEST_QUEUE_HIGHWATER", 896),
            ingest_batch_retries: parse_or("INGEST_BATCH_RETRIES", 3),
            ingest_admission_timeout: Duration::from_millis(parse_or(
                "INGEST_ADMISSION_TIMEOUT_MS",
                5000,
            )),
            ingest_max_attribute_bytes: parse_or("INGEST_MAX_ATTRIBUTE_BYTES", 4096),
            query_deadline: Duration::from_secs(parse_or("QUERY_DEADLINE_SECS", 10)),
            retention_horizon: Duration::from_secs(
                parse_or("RETENTION_HORIZON_HOURS", 720) * 3600,
            ),
            schema_required_version: parse_or(
                "SCHEMA_REQUIRED_VERSION",
                crate::schema::LATEST_VERSION,
            ),
            schema_required_version_read_only: parse_or("SCHEMA_REQUIRED_VERSION_READ_ONLY", 1),
            opamp_pending_ttl: Duration::from_secs(parse_or("OPAMP_PENDING_TTL_SECS", 1800)),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|o| o.trim().to_owned())
                .filter(|o| !o.is_empty())
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.ingest_queue_highwater <= self.ingest_queue_capacity,
            "INGEST_QUEUE_HIGHWATER must not exceed INGEST_QUEUE_CAPACITY"
        );
        anyhow::ensure!(
            self.database_pool_min <= self.database_pool_max,
            "DATABASE_POOL_MIN must not exceed DATABASE_POOL_MAX"
        );
        anyhow::ensure!(
            self.ingest_batch_max_items > 0,
            "INGEST_BATCH_MAX_ITEMS must be positive"
        );
        Ok(())
    }

    /// A config suitable for unit tests: small limits, no environment reads.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            otlp_grpc_address: "127.0.0.1:0".into(),
            database_url: "postgres://localhost/lumen_test".into(),
            database_pool_min: 1,
            database_pool_max: 4,
            ingest_batch_max_items: 8,
            ingest_batch_max_bytes: 64 * 1024,
            ingest_batch_max_delay: Duration::from_millis(10),
            ingest_queue_capacity: 16,
            ingest_queue_highwater: 12,
            ingest_batch_retries: 2,
            ingest_admission_timeout: Duration::from_millis(250),
            ingest_max_attribute_bytes: 256,
            query_deadline: Duration::from_secs(2),
            retention_horizon: Duration::from_secs(720 * 3600),
            schema_required_version: crate::schema::LATEST_VERSION,
            schema_required_version_read_only: 1,
            opamp_pending_ttl: Duration::from_secs(60),
            cors_allowed_origins: vec!["*".into()],
        }
    }
}

/// Parse an env var, falling back to `default` when unset or unparseable.
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_internally_consistent() {
        let config = Config::default_for_test();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn highwater_above_capacity_is_rejected() {
        let mut config = Config::default_for_test();
        config.ingest_queue_highwater = config.ingest_queue_capacity + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn required_version_defaults_to_latest() {
        let config = Config::default_for_test();
        assert_eq!(config.schema_required_version, crate::schema::LATEST_VERSION);
    }
}
