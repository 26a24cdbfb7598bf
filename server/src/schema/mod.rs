//! Schema migrations and the startup coordinator.
//!
//! A fleet of processes shares one database. Exactly one runs migrations:
//! whoever wins the advisory lock applies pending steps in order; everyone
//! else polls `schema_migrations` with capped backoff. Writes are gated on
//! `schema.required_version`; reads may proceed earlier at the read-only
//! floor. The observed version is published through a `watch` channel so
//! handlers can consult the gate without touching the database.
//!
//! Each migration step is individually idempotent (`IF NOT EXISTS`
//! throughout) and runs in its own transaction, so a process that dies
//! mid-migration leaves a resumable state behind — the advisory lock is
//! session-scoped and the database releases it on connection loss.

use std::time::Duration;

use sha2::{Digest, Sha256};
use sqlx::{Connection, PgPool};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// One migration step. Statements run in order inside one transaction.
struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

/// The schema version this binary was built against.
pub const LATEST_VERSION: i64 = 5;

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "dimensions",
        statements: &[
            "CREATE TABLE IF NOT EXISTS resources (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                fp_hi BIGINT NOT NULL,
                fp_lo BIGINT NOT NULL,
                attrs JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (fp_hi, fp_lo)
            )",
            "CREATE TABLE IF NOT EXISTS scopes (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                fp_hi BIGINT NOT NULL,
                fp_lo BIGINT NOT NULL,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                attrs JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (fp_hi, fp_lo)
            )",
            "CREATE TABLE IF NOT EXISTS services (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                first_seen_unix_nanos BIGINT NOT NULL,
                last_seen_unix_nanos BIGINT NOT NULL,
                UNIQUE (name, namespace)
            )",
            "CREATE TABLE IF NOT EXISTS metric_descriptors (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                fp_hi BIGINT NOT NULL,
                fp_lo BIGINT NOT NULL,
                name TEXT NOT NULL,
                kind SMALLINT NOT NULL,
                unit TEXT NOT NULL,
                temporality SMALLINT NOT NULL,
                monotonic BOOLEAN NOT NULL,
                UNIQUE (fp_hi, fp_lo)
            )",
        ],
    },
    Migration {
        version: 2,
        name: "spans",
        statements: &[
            "CREATE TABLE IF NOT EXISTS spans (
                trace_id BYTEA NOT NULL,
                span_id BYTEA NOT NULL,
                parent_span_id BYTEA,
                name TEXT NOT NULL,
                kind SMALLINT NOT NULL,
                start_unix_nanos BIGINT NOT NULL,
                end_unix_nanos BIGINT NOT NULL,
                duration_nanos BIGINT NOT NULL,
                status_code SMALLINT NOT NULL,
                status_message TEXT,
                resource_id BIGINT NOT NULL REFERENCES resources(id),
                scope_id BIGINT NOT NULL REFERENCES scopes(id),
                service_id BIGINT NOT NULL REFERENCES services(id),
                attrs JSONB NOT NULL,
                events JSONB NOT NULL,
                links JSONB NOT NULL,
                db_time_unix_nanos BIGINT NOT NULL
                    DEFAULT ((extract(epoch FROM now()) * 1000000000)::BIGINT),
                PRIMARY KEY (trace_id, span_id)
            )",
            "CREATE INDEX IF NOT EXISTS spans_start_idx
                ON spans (start_unix_nanos)",
            "CREATE INDEX IF NOT EXISTS spans_service_start_idx
                ON spans (service_id, start_unix_nanos)",
        ],
    },
    Migration {
        version: 3,
        name: "logs",
        statements: &[
            "CREATE TABLE IF NOT EXISTS logs (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                fp_hi BIGINT NOT NULL,
                fp_lo BIGINT NOT NULL,
                time_unix_nanos BIGINT NOT NULL,
                observed_time_unix_nanos BIGINT,
                severity_number SMALLINT NOT NULL,
                severity_text TEXT NOT NULL,
                body JSONB NOT NULL,
                trace_id BYTEA,
                span_id BYTEA,
                resource_id BIGINT NOT NULL REFERENCES resources(id),
                scope_id BIGINT NOT NULL REFERENCES scopes(id),
                service_id BIGINT NOT NULL REFERENCES services(id),
                attrs JSONB NOT NULL,
                db_time_unix_nanos BIGINT NOT NULL
                    DEFAULT ((extract(epoch FROM now()) * 1000000000)::BIGINT),
                UNIQUE (fp_hi, fp_lo)
            )",
            "CREATE INDEX IF NOT EXISTS logs_time_idx
                ON logs (time_unix_nanos)",
            "CREATE INDEX IF NOT EXISTS logs_trace_idx
                ON logs (trace_id) WHERE trace_id IS NOT NULL",
        ],
    },
    Migration {
        version: 4,
        name: "metric_points",
        statements: &[
            "CREATE TABLE IF NOT EXISTS metric_points (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                fp_hi BIGINT NOT NULL,
                fp_lo BIGINT NOT NULL,
                descriptor_id BIGINT NOT NULL REFERENCES metric_descriptors(id),
                resource_id BIGINT NOT NULL REFERENCES resources(id),
                scope_id BIGINT NOT NULL REFERENCES scopes(id),
                time_unix_nanos BIGINT NOT NULL,
                start_time_unix_nanos BIGINT,
                attrs JSONB NOT NULL,
                payload JSONB NOT NULL,
                value DOUBLE PRECISION,
                db_time_unix_nanos BIGINT NOT NULL
                    DEFAULT ((extract(epoch FROM now()) * 1000000000)::BIGINT),
                UNIQUE (fp_hi, fp_lo)
            )",
            "CREATE INDEX IF NOT EXISTS metric_points_time_idx
                ON metric_points (time_unix_nanos)",
            "CREATE INDEX IF NOT EXISTS metric_points_descriptor_idx
                ON metric_points (descriptor_id, time_unix_nanos)",
        ],
    },
    Migration {
        version: 5,
        name: "search_indexes",
        statements: &[
            "CREATE INDEX IF NOT EXISTS spans_duration_idx
                ON spans (service_id, duration_nanos)",
            "CREATE INDEX IF NOT EXISTS logs_severity_time_idx
                ON logs (severity_number, time_unix_nanos)",
        ],
    },
];

// ============================================================================
// Advisory lock
// ============================================================================

const LOCK_NAMESPACE: &str = "lumen.schema.migrations";

/// The cluster-wide advisory lock key: the first 8 bytes (big-endian) of
/// SHA-256 over a string constant, so every binary in the fleet agrees and
/// no application business id can collide with it.
pub fn advisory_lock_key() -> i64 {
    let digest = Sha256::digest(LOCK_NAMESPACE.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

// ============================================================================
// Version gate
// ============================================================================

/// A cheap, cloneable view of the observed schema version.
///
/// Handlers call [`SchemaGate::check_writes`] / [`SchemaGate::check_reads`]
/// before touching the database; both are lock-free reads of a watch
/// channel.
#[derive(Debug, Clone)]
pub struct SchemaGate {
    version: watch::Receiver<i64>,
    required_write: i64,
    required_read: i64,
}

impl SchemaGate {
    pub fn version(&self) -> i64 {
        *self.version.borrow()
    }

    pub fn writes_ready(&self) -> bool {
        self.version() >= self.required_write
    }

    pub fn reads_ready(&self) -> bool {
        self.version() >= self.required_read
    }

    pub fn check_writes(&self) -> Result<()> {
        if self.writes_ready() {
            Ok(())
        } else {
            Err(Error::unavailable(format!(
                "schema version {} below required {}",
                self.version(),
                self.required_write
            )))
        }
    }

    pub fn check_reads(&self) -> Result<()> {
        if self.reads_ready() {
            Ok(())
        } else {
            Err(Error::unavailable(format!(
                "schema version {} below read-only floor {}",
                self.version(),
                self.required_read
            )))
        }
    }

    /// A gate that is already open, for tests.
    #[must_use]
    pub fn open_for_test() -> Self {
        let (tx, rx) = watch::channel(LATEST_VERSION);
        // keep the sender alive for the lifetime of the receiver
        std::mem::forget(tx);
        Self {
            version: rx,
            required_write: LATEST_VERSION,
            required_read: 1,
        }
    }
}

/// Spawn the schema coordinator and return the gate immediately.
///
/// The coordinator loops: attempt the advisory lock and migrate if won;
/// otherwise observe the current version; publish it; back off (250 ms
/// doubling to 5 s) until the write requirement is met, then exit.
pub fn spawn_coordinator(
    pool: PgPool,
    required_write: i64,
    required_read: i64,
) -> (SchemaGate, tokio::task::JoinHandle<()>) {
    let (tx, rx) = watch::channel(0i64);
    let gate = SchemaGate {
        version: rx,
        required_write,
        required_read,
    };
    let handle = tokio::spawn(async move {
        let mut backoff = Duration::from_millis(250);
        loop {
            match try_migrate(&pool).await {
                Ok(Some(version)) => {
                    let _ = tx.send(version);
                    if version >= required_write {
                        tracing::info!(version, "Schema migrations complete");
                        return;
                    }
                    tracing::warn!(
                        version,
                        required_write,
                        "Migrated to latest known version but still below requirement"
                    );
                }
                Ok(None) => {
                    // Another process holds the lock; observe its progress.
                    match current_version(&pool).await {
                        Ok(version) => {
                            let _ = tx.send(version);
                            if version >= required_write {
                                tracing::info!(version, "Schema ready (migrated elsewhere)");
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to read schema version");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Migration attempt failed, will retry");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    });
    (gate, handle)
}

/// Attempt to win the advisory lock and apply pending migrations.
///
/// Returns `Ok(None)` when another process holds the lock, `Ok(Some(v))`
/// with the resulting version when this process ran (or confirmed) the
/// migrations. The lock is taken and released on one dedicated connection;
/// if the process dies in between, the database releases it on connection
/// loss.
async fn try_migrate(pool: &PgPool) -> Result<Option<i64>> {
    let key = advisory_lock_key();
    let mut conn = pool.acquire().await?;

    let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    if !acquired {
        return Ok(None);
    }

    // Holding the lock; everything below must release it before returning.
    let result = apply_pending(&mut conn).await;

    let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(&mut *conn)
        .await;
    if let Err(e) = unlock {
        // The connection is suspect; drop it rather than return it locked.
        tracing::warn!(error = %e, "Failed to release schema advisory lock, closing connection");
        let _ = conn.detach().close().await;
    }

    result.map(Some)
}

async fn apply_pending(conn: &mut sqlx::PgConnection) -> Result<i64> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(&mut *conn)
    .await?;

    let mut version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_one(&mut *conn)
            .await?;

    let start_version = version;
    for migration in MIGRATIONS.iter().filter(|m| m.version > start_version) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying schema migration"
        );
        let mut tx = conn.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        version = migration.version;
    }

    Ok(version)
}

/// Read the applied schema version; 0 when the migrations table does not
/// exist yet.
async fn current_version(pool: &PgPool) -> Result<i64> {
    let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass('schema_migrations')::text")
        .fetch_one(pool)
        .await?;
    if exists.is_none() {
        return Ok(0);
    }
    let version = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_dense() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as i64 + 1, "migration versions must be dense");
            assert!(!m.statements.is_empty());
        }
        assert_eq!(
            MIGRATIONS.last().map(|m| m.version),
            Some(LATEST_VERSION),
            "LATEST_VERSION must track the migration list"
        );
    }

    #[test]
    fn advisory_lock_key_is_deterministic() {
        assert_eq!(advisory_lock_key(), advisory_lock_key());
        // Regression guard: the key is part of the fleet-wide protocol.
        assert_ne!(advisory_lock_key(), 0);
    }

    #[test]
    fn gate_opens_at_required_version() {
        let (tx, rx) = watch::channel(0i64);
        let gate = SchemaGate {
            version: rx,
            required_write: 5,
            required_read: 1,
        };
        assert!(gate.check_writes().is_err());
        assert!(gate.check_reads().is_err());

        tx.send(1).unwrap();
        assert!(gate.check_writes().is_err());
        assert!(gate.check_reads().is_ok());

        tx.send(5).unwrap();
        assert!(gate.check_writes().is_ok());
    }

    #[test]
    fn gate_error_is_unavailable() {
        let (_tx, rx) = watch::channel(0i64);
        let gate = SchemaGate {
            version: rx,
            required_write: 5,
            required_read: 1,
        };
        let err = gate.check_writes().unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }
}
