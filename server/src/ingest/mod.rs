//! OTLP ingestion pipeline.
//!
//! Decode → normalize → admission queue → batch worker → store. The gRPC
//! and HTTP surfaces share everything below decode. Export handlers block
//! until their job's batch commits (bounded by the admission timeout), so
//! a success response means the data is durable.

pub mod decode;
pub mod grpc;
pub mod http;
pub mod normalize;
pub mod queue;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use self::decode::Decoded;
use self::normalize::NormalizePolicy;
use self::queue::{AdmissionQueue, IngestJob, JobOutcome};
use self::worker::{run_batch_loop, BatchPolicy};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::telemetry::{total_items, ItemCount};
use crate::model::{LogGroup, MetricGroup, SpanGroup};
use crate::store::Store;

/// Rejection accounting carried into an export response's
/// `partial_success`.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub rejected: i64,
    pub error_message: Option<String>,
}

/// Shared state of the ingestion pipeline: one admission queue per signal
/// plus the policies every surface agrees on.
pub struct IngestPipeline {
    span_queue: Arc<AdmissionQueue<SpanGroup>>,
    log_queue: Arc<AdmissionQueue<LogGroup>>,
    metric_queue: Arc<AdmissionQueue<MetricGroup>>,
    normalize: NormalizePolicy,
    batch: BatchPolicy,
    admission_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            span_queue: Arc::new(AdmissionQueue::new(
                config.ingest_queue_capacity,
                config.ingest_queue_highwater,
            )),
            log_queue: Arc::new(AdmissionQueue::new(
                config.ingest_queue_capacity,
                config.ingest_queue_highwater,
            )),
            metric_queue: Arc::new(AdmissionQueue::new(
                config.ingest_queue_capacity,
                config.ingest_queue_highwater,
            )),
            normalize: NormalizePolicy {
                max_attribute_bytes: config.ingest_max_attribute_bytes,
            },
            batch: BatchPolicy {
                max_items: config.ingest_batch_max_items,
                max_bytes: config.ingest_batch_max_bytes,
                max_delay: config.ingest_batch_max_delay,
                retries: config.ingest_batch_retries,
            },
            admission_timeout: config.ingest_admission_timeout,
        }
    }

    pub const fn normalize_policy(&self) -> NormalizePolicy {
        self.normalize
    }

    /// Queue depths per signal (items), for health reporting.
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (
            self.span_queue.depth(),
            self.log_queue.depth(),
            self.metric_queue.depth(),
        )
    }

    /// Spawn the three batch workers. Call once after the store exists.
    pub fn spawn_workers(&self, store: Arc<Store>) -> Vec<tokio::task::JoinHandle<()>> {
        let batch = self.batch;

        let span_store = Arc::clone(&store);
        let spans = tokio::spawn(run_batch_loop(
            Arc::clone(&self.span_queue),
            batch,
            "traces",
            move |groups| {
                let store = Arc::clone(&span_store);
                async move { store.write_span_groups(groups).await }
            },
        ));

        let log_store = Arc::clone(&store);
        let logs = tokio::spawn(run_batch_loop(
            Arc::clone(&self.log_queue),
            batch,
            "logs",
            move |groups| {
                let store = Arc::clone(&log_store);
                async move { store.write_log_groups(groups).await }
            },
        ));

        let metrics = tokio::spawn(run_batch_loop(
            Arc::clone(&self.metric_queue),
            batch,
            "metrics",
            move |groups| {
                let store = Arc::clone(&store);
                async move { store.write_metric_groups(groups).await }
            },
        ));

        vec![spans, logs, metrics]
    }

    pub async fn submit_spans(
        &self,
        decoded: Decoded<SpanGroup>,
        bytes: usize,
    ) -> Result<ExportReport> {
        submit(&self.span_queue, decoded, bytes, self.admission_timeout).await
    }

    pub async fn submit_logs(
        &self,
        decoded: Decoded<LogGroup>,
        bytes: usize,
    ) -> Result<ExportReport> {
        submit(&self.log_queue, decoded, bytes, self.admission_timeout).await
    }

    pub async fn submit_metrics(
        &self,
        decoded: Decoded<MetricGroup>,
        bytes: usize,
    ) -> Result<ExportReport> {
        submit(&self.metric_queue, decoded, bytes, self.admission_timeout).await
    }
}

/// Enqueue one export request's groups and wait for the commit.
async fn submit<G: ItemCount + Send>(
    queue: &AdmissionQueue<G>,
    decoded: Decoded<G>,
    bytes: usize,
    admission_timeout: Duration,
) -> Result<ExportReport> {
    let mut report = ExportReport {
        rejected: decoded.rejected,
        error_message: decoded.error_message,
    };

    // Losses from earlier sheds and exhausted batches whose handlers were
    // already gone surface on the next export response.
    let lost = queue.take_lost();
    if lost > 0 {
        report.rejected += lost as i64;
        report
            .error_message
            .get_or_insert_with(|| "items dropped under backpressure".to_owned());
    }

    let items = total_items(&decoded.groups);
    if items == 0 {
        return Ok(report);
    }

    let (done, outcome) = oneshot::channel();
    let job = IngestJob {
        groups: decoded.groups,
        items,
        bytes,
        done,
    };
    queue.push(job, admission_timeout).await?;

    match tokio::time::timeout(admission_timeout, outcome).await {
        // Mid-commit work finishes regardless; the collector retries and
        // idempotency absorbs the overlap.
        Err(_) => Err(Error::unavailable(
            "timed out waiting for batch commit; retry",
        )),
        Ok(Err(_)) => Err(Error::fatal("ingest worker dropped a pending job")),
        Ok(Ok(JobOutcome::Committed)) => Ok(report),
        Ok(Ok(JobOutcome::Shed { items })) => {
            report.rejected += items as i64;
            report
                .error_message
                .get_or_insert_with(|| "items shed under backpressure".to_owned());
            Ok(report)
        }
        Ok(Ok(JobOutcome::Failed(e))) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> IngestPipeline {
        IngestPipeline::new(&Config::default_for_test())
    }

    #[tokio::test]
    async fn empty_submit_reports_prior_losses() {
        let p = pipeline();
        p.span_queue.account_lost(5);
        let report = p
            .submit_spans(Decoded::default(), 0)
            .await
            .expect("empty submit succeeds");
        assert_eq!(report.rejected, 5);
        assert!(report.error_message.is_some());
        // Drained: the next report starts clean.
        let report = p.submit_spans(Decoded::default(), 0).await.unwrap();
        assert_eq!(report.rejected, 0);
    }

    #[tokio::test]
    async fn decode_rejections_flow_into_report() {
        let p = pipeline();
        let decoded = Decoded::<SpanGroup> {
            groups: vec![],
            rejected: 3,
            error_message: Some("span span_id must be 8 non-zero bytes".into()),
        };
        let report = p.submit_spans(decoded, 0).await.unwrap();
        assert_eq!(report.rejected, 3);
        assert!(report.error_message.unwrap().contains("span_id"));
    }

    #[tokio::test]
    async fn submit_waits_for_commit() {
        let p = pipeline();
        let decoded = Decoded {
            groups: vec![SpanGroup::default()],
            rejected: 0,
            error_message: None,
        };
        // One span group with zero spans counts zero items: resolves
        // immediately without a worker.
        let report = p.submit_spans(decoded, 10).await.unwrap();
        assert_eq!(report.rejected, 0);
    }
}
