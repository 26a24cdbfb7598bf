//! Dimension upserts and the fingerprint→id cache.
//!
//! Dimensions are deduplicated by content fingerprint. The cache sits in
//! front of the database: a miss performs `INSERT .. ON CONFLICT DO
//! NOTHING` followed by a select-by-fingerprint, verifies the stored
//! attributes actually match (fingerprint collisions are resolved by
//! comparison, not trusted), and caches the id on success. Two processes
//! upserting the same fingerprint concurrently observe one insert.
//!
//! The cache is sharded; a shard lock is held only for the map operation,
//! never across an await.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::Store;
use crate::error::{Error, Result};
use crate::model::value::attrs_to_json;
use crate::model::{Fingerprint, MetricDescriptor, ResourceRecord, ScopeRecord};

const SHARDS: usize = 16;

/// Which dimension a cached id belongs to; part of the cache key so the
/// three id spaces cannot alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DimKind {
    Resource,
    Scope,
    Descriptor,
}

/// A sharded LRU map from `(kind, fingerprint)` to dimension id.
#[derive(Debug)]
pub struct DimensionCache {
    shards: Vec<Mutex<LruCache<(DimKind, u128), i64>>>,
}

impl DimensionCache {
    pub fn new(total_entries: usize) -> Self {
        let per_shard = NonZeroUsize::new((total_entries / SHARDS).max(1))
            .expect("max(1) guarantees non-zero");
        Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, fp: u128) -> &Mutex<LruCache<(DimKind, u128), i64>> {
        &self.shards[(fp as usize) % SHARDS]
    }

    fn get(&self, kind: DimKind, fp: Fingerprint) -> Option<i64> {
        self.shard(fp.as_u128())
            .lock()
            .expect("dimension cache poisoned")
            .get(&(kind, fp.as_u128()))
            .copied()
    }

    fn put(&self, kind: DimKind, fp: Fingerprint, id: i64) {
        self.shard(fp.as_u128())
            .lock()
            .expect("dimension cache poisoned")
            .put((kind, fp.as_u128()), id);
    }
}

impl Store {
    /// Resolve a resource attribute map to its stable dimension id.
    pub async fn upsert_resource(&self, resource: &ResourceRecord) -> Result<i64> {
        let fp = Fingerprint::of_attrs(&resource.attrs);
        if let Some(id) = self.dims().get(DimKind::Resource, fp) {
            return Ok(id);
        }
        let attrs = attrs_to_json(&resource.attrs);

        sqlx::query(
            "INSERT INTO resources (fp_hi, fp_lo, attrs) VALUES ($1, $2, $3) \
             ON CONFLICT (fp_hi, fp_lo) DO NOTHING",
        )
        .bind(fp.hi)
        .bind(fp.lo)
        .bind(&attrs)
        .execute(self.pool())
        .await?;

        let (id, stored): (i64, serde_json::Value) =
            sqlx::query_as("SELECT id, attrs FROM resources WHERE fp_hi = $1 AND fp_lo = $2")
                .bind(fp.hi)
                .bind(fp.lo)
                .fetch_one(self.pool())
                .await?;

        if stored != attrs {
            return Err(Error::conflict(
                "resource fingerprint collided with different attributes",
            ));
        }
        self.dims().put(DimKind::Resource, fp, id);
        Ok(id)
    }

    /// Resolve an instrumentation scope to its stable dimension id.
    pub async fn upsert_scope(&self, scope: &ScopeRecord) -> Result<i64> {
        let fp = Fingerprint::of_attrs(&scope.fingerprint_attrs());
        if let Some(id) = self.dims().get(DimKind::Scope, fp) {
            return Ok(id);
        }
        let attrs = attrs_to_json(&scope.attrs);

        sqlx::query(
            "INSERT INTO scopes (fp_hi, fp_lo, name, version, attrs) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (fp_hi, fp_lo) DO NOTHING",
        )
        .bind(fp.hi)
        .bind(fp.lo)
        .bind(&scope.name)
        .bind(&scope.version)
        .bind(&attrs)
        .execute(self.pool())
        .await?;

        let (id, name, version, stored): (i64, String, String, serde_json::Value) = sqlx::query_as(
            "SELECT id, name, version, attrs FROM scopes WHERE fp_hi = $1 AND fp_lo = $2",
        )
        .bind(fp.hi)
        .bind(fp.lo)
        .fetch_one(self.pool())
        .await?;

        if name != scope.name || version != scope.version || stored != attrs {
            return Err(Error::conflict(
                "scope fingerprint collided with different identity",
            ));
        }
        self.dims().put(DimKind::Scope, fp, id);
        Ok(id)
    }

    /// Resolve a metric descriptor to its stable dimension id.
    pub async fn upsert_metric_descriptor(&self, descriptor: &MetricDescriptor) -> Result<i64> {
        let fp = Fingerprint::of_attrs(&descriptor.fingerprint_attrs());
        if let Some(id) = self.dims().get(DimKind::Descriptor, fp) {
            return Ok(id);
        }

        sqlx::query(
            "INSERT INTO metric_descriptors (fp_hi, fp_lo, name, kind, unit, temporality, monotonic) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (fp_hi, fp_lo) DO NOTHING",
        )
        .bind(fp.hi)
        .bind(fp.lo)
        .bind(&descriptor.name)
        .bind(descriptor.kind.as_i16())
        .bind(&descriptor.unit)
        .bind(descriptor.temporality.as_i16())
        .bind(descriptor.monotonic)
        .execute(self.pool())
        .await?;

        let (id, name, unit): (i64, String, String) = sqlx::query_as(
            "SELECT id, name, unit FROM metric_descriptors WHERE fp_hi = $1 AND fp_lo = $2",
        )
        .bind(fp.hi)
        .bind(fp.lo)
        .fetch_one(self.pool())
        .await?;

        if name != descriptor.name || unit != descriptor.unit {
            return Err(Error::conflict(
                "metric descriptor fingerprint collided with different identity",
            ));
        }
        self.dims().put(DimKind::Descriptor, fp, id);
        Ok(id)
    }

    /// Resolve a `(service.name, service.namespace)` pair, advancing its
    /// seen range. Not cached: the range advances on nearly every batch.
    pub async fn upsert_service(
        &self,
        name: &str,
        namespace: &str,
        seen_unix_nanos: i64,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO services (name, namespace, first_seen_unix_nanos, last_seen_unix_nanos) \
             VALUES ($1, $2, $3, $3) \
             ON CONFLICT (name, namespace) DO UPDATE SET \
                 first_seen_unix_nanos = LEAST(services.first_seen_unix_nanos, EXCLUDED.first_seen_unix_nanos), \
                 last_seen_unix_nanos = GREATEST(services.last_seen_unix_nanos, EXCLUDED.last_seen_unix_nanos) \
             RETURNING id",
        )
        .bind(name)
        .bind(namespace)
        .bind(seen_unix_nanos)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_after_put() {
        let cache = DimensionCache::new(64);
        let fp = Fingerprint { hi: 1, lo: 2 };
        assert_eq!(cache.get(DimKind::Resource, fp), None);
        cache.put(DimKind::Resource, fp, 42);
        assert_eq!(cache.get(DimKind::Resource, fp), Some(42));
    }

    #[test]
    fn kinds_do_not_alias() {
        let cache = DimensionCache::new(64);
        let fp = Fingerprint { hi: 1, lo: 2 };
        cache.put(DimKind::Resource, fp, 1);
        cache.put(DimKind::Scope, fp, 2);
        assert_eq!(cache.get(DimKind::Resource, fp), Some(1));
        assert_eq!(cache.get(DimKind::Scope, fp), Some(2));
        assert_eq!(cache.get(DimKind::Descriptor, fp), None);
    }

    #[test]
    fn lru_evicts_oldest_within_shard() {
        // One entry per shard: inserting two keys that land in the same
        // shard evicts the first.
        let cache = DimensionCache::new(SHARDS);
        let a = Fingerprint { hi: 0, lo: 0 };
        let b = Fingerprint {
            hi: 0,
            lo: SHARDS as i64,
        };
        cache.put(DimKind::Resource, a, 1);
        cache.put(DimKind::Resource, b, 2);
        assert_eq!(cache.get(DimKind::Resource, a), None);
        assert_eq!(cache.get(DimKind::Resource, b), Some(2));
    }
}
