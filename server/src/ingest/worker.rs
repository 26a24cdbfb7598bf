//! Background batch writers.
//!
//! One worker per signal drains its admission queue, accumulates jobs into
//! a batch bounded by items, bytes, or delay (whichever first), and commits
//! through the store. Retryable failures back off exponentially with jitter
//! for a bounded number of attempts; this is the only place in the process
//! that retries.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::queue::{AdmissionQueue, IngestJob, JobOutcome};
use crate::error::{Error, Result};
use crate::store::WriteOutcome;

/// Batch assembly and retry limits, derived from config.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub max_items: usize,
    pub max_bytes: usize,
    pub max_delay: Duration,
    pub retries: u32,
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_JITTER_MS: u64 = 50;

/// Run one signal's batch loop until the process shuts down.
///
/// `write` persists a slice of groups atomically and reports how many facts
/// were inserted vs. silently skipped as duplicates.
pub async fn run_batch_loop<G, F, Fut>(
    queue: Arc<AdmissionQueue<G>>,
    policy: BatchPolicy,
    signal: &'static str,
    write: F,
) where
    G: Send + 'static,
    F: Fn(Arc<Vec<G>>) -> Fut,
    Fut: std::future::Future<Output = Result<WriteOutcome>>,
{
    loop {
        let first = queue.pop().await;
        let mut jobs = vec![first];
        let mut items = jobs[0].items;
        let mut bytes = jobs[0].bytes;

        // Accumulate until a threshold trips. The delay window opens at the
        // first job, so a trickle of small exports still flushes promptly.
        let deadline = tokio::time::Instant::now() + policy.max_delay;
        while items < policy.max_items && bytes < policy.max_bytes {
            match tokio::time::timeout_at(deadline, queue.pop()).await {
                Ok(job) => {
                    items += job.items;
                    bytes += job.bytes;
                    jobs.push(job);
                }
                Err(_) => break,
            }
        }

        let mut groups = Vec::new();
        for job in &mut jobs {
            groups.append(&mut job.groups);
        }
        let groups = Arc::new(groups);

        match write_with_retries(&write, groups, policy.retries, signal).await {
            Ok(outcome) => {
                tracing::debug!(
                    signal,
                    jobs = jobs.len(),
                    items,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "Committed ingest batch"
                );
                for job in jobs {
                    let _ = job.done.send(JobOutcome::Committed);
                }
            }
            Err(e) => {
                tracing::warn!(signal, items, error = %e, "Dropping ingest batch after retries");
                for job in jobs {
                    let lost = job.items;
                    if job
                        .done
                        .send(JobOutcome::Failed(Error::unavailable(format!(
                            "batch write failed: {e}"
                        ))))
                        .is_err()
                    {
                        queue.account_lost(lost);
                    }
                }
            }
        }
    }
}

async fn write_with_retries<G, F, Fut>(
    write: &F,
    groups: Arc<Vec<G>>,
    retries: u32,
    signal: &'static str,
) -> Result<WriteOutcome>
where
    F: Fn(Arc<Vec<G>>) -> Fut,
    Fut: std::future::Future<Output = Result<WriteOutcome>>,
{
    let mut attempt = 0u32;
    loop {
        match write(Arc::clone(&groups)).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && attempt < retries => {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt)
                    + Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS));
                tracing::debug!(
                    signal,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying batch write"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn job(items: usize) -> (IngestJob<u8>, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            IngestJob {
                groups: vec![1u8],
                items,
                bytes: 1,
                done: tx,
            },
            rx,
        )
    }

    const POLICY: BatchPolicy = BatchPolicy {
        max_items: 4,
        max_bytes: 1024,
        max_delay: Duration::from_millis(20),
        retries: 2,
    };

    #[tokio::test]
    async fn commits_resolve_all_jobs_in_batch() {
        let queue = Arc::new(AdmissionQueue::new(100, 100));
        let (a, ra) = job(1);
        let (b, rb) = job(1);
        queue.push(a, Duration::from_millis(50)).await.unwrap();
        queue.push(b, Duration::from_millis(50)).await.unwrap();

        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            run_batch_loop(q, POLICY, "test", |_groups| async {
                Ok(WriteOutcome {
                    inserted: 1,
                    duplicates: 0,
                })
            })
            .await;
        });

        assert!(matches!(ra.await.unwrap(), JobOutcome::Committed));
        assert!(matches!(rb.await.unwrap(), JobOutcome::Committed));
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_then_succeed() {
        let queue = Arc::new(AdmissionQueue::new(100, 100));
        let (a, ra) = job(1);
        queue.push(a, Duration::from_millis(50)).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            run_batch_loop(q, POLICY, "test", move |_groups| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::unavailable("transient"))
                    } else {
                        Ok(WriteOutcome {
                            inserted: 1,
                            duplicates: 0,
                        })
                    }
                }
            })
            .await;
        });

        assert!(matches!(ra.await.unwrap(), JobOutcome::Committed));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let queue = Arc::new(AdmissionQueue::new(100, 100));
        let (a, ra) = job(1);
        queue.push(a, Duration::from_millis(50)).await.unwrap();

        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            run_batch_loop(q, POLICY, "test", |_groups| async {
                Err(Error::unavailable("still down"))
            })
            .await;
        });

        match ra.await.unwrap() {
            JobOutcome::Failed(e) => assert_eq!(e.code(), "unavailable"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let queue = Arc::new(AdmissionQueue::new(100, 100));
        let (a, ra) = job(1);
        queue.push(a, Duration::from_millis(50)).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let q = Arc::clone(&queue);
        tokio::spawn(async move {
            run_batch_loop(q, POLICY, "test", move |_groups| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::fatal("constraint violated"))
                }
            })
            .await;
        });

        assert!(matches!(ra.await.unwrap(), JobOutcome::Failed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
