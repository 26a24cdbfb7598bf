//! Storage layer — typed operations over the star schema.
//!
//! `PostgreSQL` via sqlx. The `Store` owns the connection pool, the
//! dimension cache, and the per-category admission semaphores. All SQL
//! lives behind typed operations in the submodules; callers never see a
//! query string.
//!
//! Ingest and query share one pool. Rather than two pools (which doubles
//! the connection count), each category takes a semaphore permit before
//! acquiring a connection, so a read storm cannot starve ingest and vice
//! versa. One connection's worth of headroom is left for the schema
//! coordinator and the retention job.

mod detail;
mod dimensions;
mod retention;
mod search;
mod service_map;
mod services;
mod write;

pub use detail::{choose_root, SpanDetailRow, TraceDetail};
pub use dimensions::DimensionCache;
pub use retention::spawn_retention_task;
pub use search::{
    Filter, FilterOp, LogQuery, LogRow, MetricPointRow, MetricQuery, Page, RowPage, SpanQuery,
    SpanRow, TimeField, TimeRange, TraceQuery, TraceSummary, MAX_PAGE_SIZE,
};
pub use service_map::{LatencyDigest, ServiceMap, ServiceMapEdge, ServiceMapNode};
pub use services::ServiceCatalogEntry;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::Config;
use crate::error::Result;

/// Bound on fingerprint→id cache entries across all dimension kinds.
const DIMENSION_CACHE_ENTRIES: usize = 16_384;

/// Outcome of a transactional batch write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOutcome {
    /// Fact rows actually inserted.
    pub inserted: u64,
    /// Fact rows skipped because their idempotency key already existed.
    pub duplicates: u64,
}

impl WriteOutcome {
    pub(crate) fn merge(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
    }
}

/// Create the `PostgreSQL` connection pool.
pub async fn create_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(config.database_pool_min)
        .max_connections(config.database_pool_max)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;

    info!(
        min = config.database_pool_min,
        max = config.database_pool_max,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Typed storage operations over the star schema.
pub struct Store {
    pool: PgPool,
    dims: DimensionCache,
    ingest_permits: Arc<Semaphore>,
    query_permits: Arc<Semaphore>,
    retention_horizon: Duration,
}

impl Store {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        // Split the pool between categories, holding one connection back
        // for the coordinator and retention job.
        let total = config.database_pool_max.max(3) as usize;
        let ingest_cap = (total / 2).max(1);
        let query_cap = (total - ingest_cap).saturating_sub(1).max(1);
        Self {
            pool,
            dims: DimensionCache::new(DIMENSION_CACHE_ENTRIES),
            ingest_permits: Arc::new(Semaphore::new(ingest_cap)),
            query_permits: Arc::new(Semaphore::new(query_cap)),
            retention_horizon: config.retention_horizon,
        }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn dims(&self) -> &DimensionCache {
        &self.dims
    }

    pub(crate) async fn ingest_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.ingest_permits)
            .acquire_owned()
            .await
            .map_err(|_| crate::error::Error::unavailable("store is shutting down"))
    }

    pub(crate) async fn query_permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.query_permits)
            .acquire_owned()
            .await
            .map_err(|_| crate::error::Error::unavailable("store is shutting down"))
    }

    /// Clamp a query window's start to the retention horizon; rows older
    /// than the horizon are never returned even if deletion lags.
    pub(crate) fn clamp_to_horizon(&self, start_nanos: i64) -> i64 {
        let now_nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        let horizon_nanos = self.retention_horizon.as_nanos().min(i64::MAX as u128) as i64;
        start_nanos.max(now_nanos.saturating_sub(horizon_nanos))
    }

    /// Liveness probe for `/health/db`.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_outcome_merge_accumulates() {
        let mut a = WriteOutcome {
            inserted: 2,
            duplicates: 1,
        };
        a.merge(WriteOutcome {
            inserted: 3,
            duplicates: 4,
        });
        assert_eq!(a.inserted, 5);
        assert_eq!(a.duplicates, 5);
    }
}
