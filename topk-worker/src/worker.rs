use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::{send_keyed_iter_to_kafka, KafkaContext};
use health::HealthHandle;
use rdkafka::producer::FutureProducer;
use tokio::sync;
use topk_core::{CrawlJob, IngestionEvent, RetryPolicy, ScheduleStore};
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::metrics_consts::*;
use crate::provider::ProviderAdapter;

const RECV_TIMEOUT: time::Duration = time::Duration::from_secs(10);

/// What happened to a crawl job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Events were fetched and published, the schedule is idle until the next period.
    Completed { published: usize },
    /// The schedule was not enqueued anymore: a duplicate job, or one
    /// reconciliation already took back.
    Skipped,
    /// The crawl failed and the schedule is idle until `retry_at`.
    Released { retry_at: DateTime<Utc> },
}

/// Runs a single crawl job against the schedule store, the provider and the
/// events topic.
pub struct CrawlProcessor<P> {
    store: ScheduleStore,
    provider: P,
    producer: FutureProducer<KafkaContext>,
    events_topic: String,
    period: chrono::Duration,
    retry_policy: RetryPolicy,
}

impl<P: ProviderAdapter> CrawlProcessor<P> {
    pub fn new(
        store: ScheduleStore,
        provider: P,
        producer: FutureProducer<KafkaContext>,
        events_topic: &str,
        period: chrono::Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            producer,
            events_topic: events_topic.to_owned(),
            period,
            retry_policy,
        }
    }

    /// Claims the schedule, crawls, then moves the schedule back to idle.
    ///
    /// A failed fetch or publish is not an error of this function: the
    /// schedule is released with a backoff and the outcome says so. Only store
    /// failures are returned, and those leave the row for reconciliation.
    pub async fn process(&self, job: &CrawlJob) -> Result<CrawlOutcome, WorkerError> {
        let labels = [("provider".to_string(), job.provider.clone())];
        let _time = common_metrics::timing_guard(JOB_TIME, &labels);

        let started = Utc::now();
        let Some(running) = self
            .store
            .mark_running(&job.user_id, &job.provider, started)
            .await?
        else {
            info!(
                user_id = %job.user_id,
                provider = %job.provider,
                "schedule is not enqueued anymore, skipping crawl job"
            );
            common_metrics::inc(JOBS_SKIPPED, &labels, 1);
            return Ok(CrawlOutcome::Skipped);
        };

        match self.crawl(job).await {
            Ok(published) => {
                // Events fetched before `started` are covered, the next job resumes from there
                let completed = self
                    .store
                    .complete(&job.user_id, &job.provider, Utc::now(), self.period, started)
                    .await?;
                if !completed {
                    warn!(
                        user_id = %job.user_id,
                        provider = %job.provider,
                        "schedule was reconciled while running, not rescheduling"
                    );
                }
                common_metrics::inc(JOBS_COMPLETED, &labels, 1);
                common_metrics::inc(EVENTS_PUBLISHED, &labels, published as u64);
                Ok(CrawlOutcome::Completed { published })
            }
            Err(e) => {
                let attempt = u32::try_from(running.failed_attempts).unwrap_or(0) + 1;
                let now = Utc::now();
                let retry_at = now
                    + chrono::Duration::from_std(self.retry_policy.retry_interval(attempt))
                        .unwrap_or(self.period);
                error!(
                    user_id = %job.user_id,
                    provider = %job.provider,
                    attempt,
                    %retry_at,
                    error = %e,
                    "crawl failed, releasing schedule"
                );
                self.store
                    .release(&job.user_id, &job.provider, now, retry_at)
                    .await?;
                common_metrics::inc(JOBS_RELEASED, &labels, 1);
                Ok(CrawlOutcome::Released { retry_at })
            }
        }
    }

    async fn crawl(&self, job: &CrawlJob) -> Result<usize, WorkerError> {
        let events = self
            .provider
            .fetch_since(&job.user_id, &job.provider, job.since)
            .await?;
        let total = events.len();

        let results = send_keyed_iter_to_kafka(
            &self.producer,
            &self.events_topic,
            |event: &IngestionEvent| Some(event.user_id.clone()),
            events,
        )
        .await;

        let mut errors = results.into_iter().filter_map(Result::err);
        if let Some(first) = errors.next() {
            // Whatever did get published is deduplicated when the job is retried
            return Err(WorkerError::PublishError {
                failed: errors.count() + 1,
                total,
                first,
            });
        }
        Ok(total)
    }
}

/// Consumes crawl jobs and processes up to `max_concurrent_jobs` of them at once.
pub struct Worker<P> {
    consumer: SingleTopicConsumer,
    processor: Arc<CrawlProcessor<P>>,
    max_concurrent_jobs: NonZeroUsize,
    liveness: HealthHandle,
}

impl<P: ProviderAdapter> Worker<P> {
    pub fn new(
        consumer: SingleTopicConsumer,
        processor: CrawlProcessor<P>,
        max_concurrent_jobs: NonZeroUsize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            consumer,
            processor: Arc::new(processor),
            max_concurrent_jobs,
            liveness,
        }
    }

    /// Run this worker to continuously process crawl jobs as they arrive.
    ///
    /// A job's offset is stored once the job is handled, whatever its outcome.
    /// Offsets of concurrent jobs may be stored out of order, so a crash can
    /// skip an unfinished job: its schedule stays enqueued or running and
    /// reconciliation makes it due again.
    pub async fn run(&self) {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs.get()));
        let no_labels: [(String, String); 0] = [];

        loop {
            common_metrics::gauge(
                WORKER_SATURATION,
                &no_labels,
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs.get() as f64,
            );
            self.liveness.report_healthy().await;

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                error!("worker semaphore closed");
                return;
            };

            // Bounded wait, so an idle topic still reports liveness
            let Ok(received) =
                tokio::time::timeout(RECV_TIMEOUT, self.consumer.json_recv::<CrawlJob>()).await
            else {
                continue;
            };
            let (job, offset) = match received {
                Ok(received) => received,
                Err(e) => {
                    // Undecodable jobs already had their offset stored
                    warn!(error = %WorkerError::from(e), "skipping crawl job");
                    common_metrics::inc(JOBS_UNDECODABLE, &no_labels, 1);
                    continue;
                }
            };
            common_metrics::inc(JOBS_RECEIVED, &no_labels, 1);

            let processor = self.processor.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.process(&job).await {
                    error!(
                        user_id = %job.user_id,
                        provider = %job.provider,
                        error = %e,
                        "failed to process crawl job"
                    );
                }
                if let Err(e) = offset.store() {
                    warn!(error = %e, "failed to store crawl job offset");
                }
                drop(permit);
            });
        }
    }
}
