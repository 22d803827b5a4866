use chrono::{Days, Utc};
use common_kafka::kafka_producer::{send_keyed_iter_to_kafka, KafkaContext};
use rdkafka::producer::FutureProducer;
use topk_core::{CrawlJob, CrawlSchedule, PgCounterStore, ScheduleStore, StoreError};
use tracing::{error, info, warn};

use crate::config::SchedulerSettings;
use crate::metrics_consts::*;

/// Outcome of one `poll`, mostly for tests: the service reports it through metrics.
#[derive(Debug, Default)]
pub struct PollResult {
    /// Every row moved from idle to enqueued during this poll
    pub claimed: Vec<CrawlSchedule>,
    /// Claimed rows whose job could not be published. They stay enqueued
    /// until reconciliation puts them back to idle.
    pub publish_failures: usize,
}

pub struct Scheduler {
    pub store: ScheduleStore,
    pub counters: PgCounterStore,
    pub kafka_producer: FutureProducer<KafkaContext>,
    pub settings: SchedulerSettings,
    pub metrics_labels: Vec<(String, String)>,
}

impl Scheduler {
    /// Claims every due row, in batches, and publishes one crawl job per claimed row.
    pub async fn poll(&self) -> Result<PollResult, StoreError> {
        let _time = common_metrics::timing_guard(POLL_TIME, &self.metrics_labels);
        common_metrics::inc(POLL_RUNS, &self.metrics_labels, 1);

        let mut result = PollResult::default();
        loop {
            let now = Utc::now();
            let batch = self
                .store
                .claim_due(now, self.settings.poll_batch_size)
                .await?;
            let batch_len = batch.len();
            if batch_len == 0 {
                break;
            }
            common_metrics::inc(CLAIMED_COUNT, &self.metrics_labels, batch_len as u64);

            let jobs = batch
                .iter()
                .map(|schedule| CrawlJob::for_schedule(schedule, self.settings.initial_lookback, now));
            let sends = send_keyed_iter_to_kafka(
                &self.kafka_producer,
                &self.settings.jobs_topic,
                |job: &CrawlJob| Some(job.user_id.clone()),
                jobs,
            )
            .await;

            for (schedule, send) in batch.iter().zip(sends) {
                if let Err(e) = send {
                    result.publish_failures += 1;
                    error!(
                        user_id = %schedule.user_id,
                        provider = %schedule.provider,
                        error = %e,
                        "failed to publish crawl job, leaving it to reconciliation"
                    );
                }
            }

            result.claimed.extend(batch);
            if (batch_len as i64) < self.settings.poll_batch_size {
                break;
            }
        }

        if result.publish_failures > 0 {
            common_metrics::inc(
                PUBLISH_FAILED_COUNT,
                &self.metrics_labels,
                result.publish_failures as u64,
            );
        }
        if !result.claimed.is_empty() {
            info!(
                claimed = result.claimed.len(),
                publish_failures = result.publish_failures,
                "enqueued crawl jobs"
            );
        }
        Ok(result)
    }

    /// Puts rows stuck in enqueued or running back to idle, due now.
    pub async fn reconcile(&self) -> Result<u64, StoreError> {
        let _time = common_metrics::timing_guard(RECONCILE_TIME, &self.metrics_labels);

        let reset = self
            .store
            .reconcile_stale(Utc::now(), self.settings.stale_after)
            .await?;
        common_metrics::inc(RECONCILED_COUNT, &self.metrics_labels, reset);

        if reset > 0 {
            warn!("reset {} stale crawl schedules", reset);
        }
        Ok(reset)
    }

    /// Deletes aggregate counts older than the retention window.
    pub async fn enforce_retention(&self) -> Result<u64, StoreError> {
        let _time = common_metrics::timing_guard(RETENTION_TIME, &self.metrics_labels);

        let today = Utc::now().date_naive();
        let cutoff = today
            .checked_sub_days(Days::new(self.settings.counter_retention_days.max(0) as u64))
            .unwrap_or(today);
        let deleted = self.counters.delete_before(cutoff).await?;
        common_metrics::inc(RETENTION_DELETED_COUNT, &self.metrics_labels, deleted);

        info!(%cutoff, deleted, "applied counter retention");
        Ok(deleted)
    }
}
