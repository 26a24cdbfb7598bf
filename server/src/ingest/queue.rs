//! Bounded admission queues between the export handlers and the store.
//!
//! Each signal (traces/logs/metrics) gets one queue. A queue holds *jobs* —
//! one per export request — each carrying its decoded groups and a
//! completion channel the handler awaits, so collector-visible success
//! implies a committed batch.
//!
//! Sizing is in telemetry items, not jobs. Above the high-water mark the
//! oldest jobs are shed and their completion channels resolve with the shed
//! count; at capacity, producers wait for space up to the admission timeout.
//! Queue depth is the system's primary backpressure signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::error::{Error, Result};

/// How a job left the queue.
#[derive(Debug)]
pub enum JobOutcome {
    /// The batch containing this job committed; duplicates were silently
    /// skipped by the store.
    Committed,
    /// The job was shed at the high-water mark before reaching the store.
    Shed { items: usize },
    /// Retries were exhausted or the write failed permanently.
    Failed(Error),
}

/// One export request's worth of decoded groups awaiting persistence.
#[derive(Debug)]
pub struct IngestJob<G> {
    pub groups: Vec<G>,
    pub items: usize,
    pub bytes: usize,
    pub done: oneshot::Sender<JobOutcome>,
}

/// A bounded FIFO of ingest jobs with shed-oldest overflow accounting.
#[derive(Debug)]
pub struct AdmissionQueue<G> {
    inner: Mutex<Inner<G>>,
    /// Hard bound in items; producers wait (bounded) when exceeded.
    capacity: usize,
    /// Shed-oldest trigger in items.
    highwater: usize,
    job_ready: Notify,
    space_free: Notify,
    /// Items lost without a live handler to tell (shed or failed after the
    /// producer gave up waiting). Drained into the next export response.
    unreported_lost: AtomicU64,
}

#[derive(Debug)]
struct Inner<G> {
    jobs: VecDeque<IngestJob<G>>,
    queued_items: usize,
}

impl<G> AdmissionQueue<G> {
    pub fn new(capacity: usize, highwater: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: VecDeque::new(),
                queued_items: 0,
            }),
            capacity,
            highwater,
            job_ready: Notify::new(),
            space_free: Notify::new(),
            unreported_lost: AtomicU64::new(0),
        }
    }

    /// Enqueue a job, waiting up to `timeout` for space below capacity.
    ///
    /// After a successful push the queue sheds oldest jobs (never the one
    /// just pushed) until the item count is back at the high-water mark.
    pub async fn push(&self, job: IngestJob<G>, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut job = Some(job);
        loop {
            let mut shed = Vec::new();
            {
                let mut inner = self.inner.lock().expect("admission queue poisoned");
                let incoming = job.as_ref().expect("job present until pushed");
                if inner.jobs.is_empty() || inner.queued_items + incoming.items <= self.capacity {
                    let incoming = job.take().expect("job present until pushed");
                    inner.queued_items += incoming.items;
                    inner.jobs.push_back(incoming);
                    // Shed-oldest: drop from the front until we are back at
                    // the high-water mark, keeping at least the newest job.
                    while inner.queued_items > self.highwater && inner.jobs.len() > 1 {
                        let victim = inner.jobs.pop_front().expect("len > 1");
                        inner.queued_items -= victim.items;
                        shed.push(victim);
                    }
                }
            }
            if job.is_none() {
                for victim in shed {
                    self.resolve_shed(victim);
                }
                self.job_ready.notify_one();
                return Ok(());
            }
            debug_assert!(shed.is_empty());
            if tokio::time::timeout_at(deadline, self.space_free.notified())
                .await
                .is_err()
            {
                return Err(Error::unavailable("ingest admission queue is full"));
            }
        }
    }

    /// Wait for the next job.
    pub async fn pop(&self) -> IngestJob<G> {
        loop {
            if let Some(job) = self.try_pop() {
                return job;
            }
            self.job_ready.notified().await;
        }
    }

    /// Take a job if one is queued, without waiting.
    pub fn try_pop(&self) -> Option<IngestJob<G>> {
        let job = {
            let mut inner = self.inner.lock().expect("admission queue poisoned");
            let job = inner.jobs.pop_front()?;
            inner.queued_items -= job.items;
            job
        };
        self.space_free.notify_one();
        Some(job)
    }

    /// Items currently queued, for health reporting.
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .expect("admission queue poisoned")
            .queued_items
    }

    /// Record items lost with no live handler to report them.
    pub fn account_lost(&self, items: usize) {
        self.unreported_lost
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    /// Drain the unreported-loss counter into an export response.
    pub fn take_lost(&self) -> u64 {
        self.unreported_lost.swap(0, Ordering::Relaxed)
    }

    fn resolve_shed(&self, job: IngestJob<G>) {
        let items = job.items;
        if job.done.send(JobOutcome::Shed { items }).is_err() {
            // Handler already gave up; surface the loss on a later response.
            self.account_lost(items);
        }
        tracing::warn!(items, "Shed oldest ingest job at high-water mark");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(items: usize) -> (IngestJob<u8>, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            IngestJob {
                groups: vec![0u8; 1],
                items,
                bytes: items * 10,
                done: tx,
            },
            rx,
        )
    }

    const T: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn fifo_order() {
        let queue = AdmissionQueue::new(100, 100);
        let (a, _ra) = job(1);
        let (b, _rb) = job(1);
        queue.push(a, T).await.unwrap();
        queue.push(b, T).await.unwrap();
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.try_pop().unwrap().items, 1);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn sheds_oldest_above_highwater() {
        let queue = AdmissionQueue::new(100, 10);
        let (a, ra) = job(6);
        let (b, rb) = job(6);
        queue.push(a, T).await.unwrap();
        queue.push(b, T).await.unwrap();
        // 12 items > highwater 10: the oldest job is shed
        assert_eq!(queue.depth(), 6);
        match ra.await.unwrap() {
            JobOutcome::Shed { items } => assert_eq!(items, 6),
            other => panic!("expected shed, got {other:?}"),
        }
        drop(rb);
    }

    #[tokio::test]
    async fn never_sheds_the_only_job() {
        let queue = AdmissionQueue::new(100, 10);
        let (a, mut ra) = job(50); // larger than highwater but alone
        queue.push(a, T).await.unwrap();
        assert_eq!(queue.depth(), 50);
        assert!(ra.try_recv().is_err(), "sole job must not be shed");
    }

    #[tokio::test]
    async fn full_queue_times_out_with_unavailable() {
        let queue = AdmissionQueue::new(10, 10);
        let (a, _ra) = job(10);
        queue.push(a, T).await.unwrap();
        let (b, _rb) = job(5);
        let err = queue.push(b, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }

    #[tokio::test]
    async fn push_resumes_when_space_frees() {
        let queue = std::sync::Arc::new(AdmissionQueue::new(10, 10));
        let (a, _ra) = job(10);
        queue.push(a, T).await.unwrap();

        let q = std::sync::Arc::clone(&queue);
        let pusher = tokio::spawn(async move {
            let (b, _rb) = job(5);
            q.push(b, Duration::from_secs(1)).await
        });
        tokio::task::yield_now().await;
        let _ = queue.pop().await;
        assert!(pusher.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn lost_accounting_drains_once() {
        let queue = AdmissionQueue::<u8>::new(10, 10);
        queue.account_lost(7);
        assert_eq!(queue.take_lost(), 7);
        assert_eq!(queue.take_lost(), 0);
    }

    #[tokio::test]
    async fn shed_without_listener_goes_to_lost_counter() {
        let queue = AdmissionQueue::new(100, 10);
        let (a, ra) = job(8);
        drop(ra); // handler already gone
        queue.push(a, T).await.unwrap();
        let (b, _rb) = job(8);
        queue.push(b, T).await.unwrap();
        assert_eq!(queue.take_lost(), 8);
    }
}
