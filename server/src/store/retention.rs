//! Retention — hard-delete fact rows older than the configured horizon.
//!
//! One task per process on an hourly timer. Deletes run in bounded batches
//! so no long-held locks build up; dimension rows are immutable and tiny
//! and are never deleted. Queries clamp their windows to the same horizon,
//! so rows awaiting deletion are already invisible.

use std::time::{Duration, Instant};

use sqlx::PgPool;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
const DELETE_BATCH_SIZE: i64 = 10_000;

/// Start the hourly retention background task.
///
/// The first tick is consumed immediately so a restart burst does not
/// coincide with a purge cycle.
pub fn spawn_retention_task(pool: PgPool, horizon: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_INTERVAL);
        interval.tick().await; // consume immediate first tick
        loop {
            interval.tick().await;
            run_retention_cycle(&pool, horizon).await;
        }
    })
}

/// Execute one purge cycle across all fact tables.
#[tracing::instrument(skip(pool, horizon))]
async fn run_retention_cycle(pool: &PgPool, horizon: Duration) {
    let started = Instant::now();
    let Some(cutoff) = cutoff_nanos(horizon) else {
        return;
    };

    let spans_deleted = purge_in_batches(
        pool,
        "DELETE FROM spans WHERE ctid IN (\
             SELECT ctid FROM spans WHERE start_unix_nanos < $1 LIMIT $2\
         )",
        cutoff,
        "spans",
    )
    .await;
    let logs_deleted = purge_in_batches(
        pool,
        "DELETE FROM logs WHERE id IN (\
             SELECT id FROM logs WHERE time_unix_nanos < $1 LIMIT $2\
         )",
        cutoff,
        "logs",
    )
    .await;
    let points_deleted = purge_in_batches(
        pool,
        "DELETE FROM metric_points WHERE id IN (\
             SELECT id FROM metric_points WHERE time_unix_nanos < $1 LIMIT $2\
         )",
        cutoff,
        "metric points",
    )
    .await;

    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        spans_deleted,
        logs_deleted,
        points_deleted,
        "Retention cycle completed"
    );
}

fn cutoff_nanos(horizon: Duration) -> Option<i64> {
    let now = chrono::Utc::now().timestamp_nanos_opt()?;
    let horizon_nanos = horizon.as_nanos().min(i64::MAX as u128) as i64;
    Some(now.saturating_sub(horizon_nanos))
}

/// Delete matching rows in batches until a short batch signals completion.
async fn purge_in_batches(pool: &PgPool, sql: &str, cutoff: i64, table_label: &str) -> i64 {
    let mut total_deleted: i64 = 0;
    loop {
        match sqlx::query(sql)
            .bind(cutoff)
            .bind(DELETE_BATCH_SIZE)
            .execute(pool)
            .await
        {
            Ok(result) => {
                let deleted = result.rows_affected() as i64;
                total_deleted += deleted;
                if deleted < DELETE_BATCH_SIZE {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, table = table_label, "Failed to purge old {table_label}");
                break;
            }
        }
    }
    total_deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_in_the_past() {
        let horizon = Duration::from_secs(3600);
        let cutoff = cutoff_nanos(horizon).unwrap();
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap();
        assert!(cutoff < now);
        assert!(now - cutoff >= 3600 * 1_000_000_000);
    }

    #[test]
    fn oversized_horizon_saturates() {
        let cutoff = cutoff_nanos(Duration::from_secs(u64::MAX)).unwrap();
        assert!(cutoff <= 0);
    }
}
