use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::kafka_consumer::consumer_client_config;
use health::HealthHandle;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use thiserror::Error;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use topk_core::{CounterStore, DedupError, DedupStore, IngestionEvent};
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::metrics_consts::*;

/// Reports liveness from the librdkafka statistics callback and remembers
/// which partitions were revoked, so their offsets are not committed.
pub struct AggregatorContext {
    liveness: HealthHandle,
    revoked: Arc<Mutex<Vec<i32>>>,
}

impl AggregatorContext {
    pub fn new(liveness: HealthHandle) -> Self {
        Self {
            liveness,
            revoked: Default::default(),
        }
    }

    /// Partitions revoked since the last call.
    pub fn take_revoked(&self) -> Vec<i32> {
        match self.revoked.lock() {
            Ok(mut revoked) => std::mem::take(&mut *revoked),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ClientContext for AggregatorContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy_blocking();
    }
}

impl ConsumerContext for AggregatorContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                info!("revoking {} partitions", partitions.count());
                let revoked: Vec<i32> = partitions
                    .elements()
                    .iter()
                    .map(|elem| elem.partition())
                    .collect();
                match self.revoked.lock() {
                    Ok(mut pending) => pending.extend(revoked),
                    Err(poisoned) => poisoned.into_inner().extend(revoked),
                }
            }
            Rebalance::Assign(partitions) => {
                info!("assigned {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
            }
        }
    }
}

pub fn create_consumer(
    kafka_config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
    liveness: HealthHandle,
) -> Result<StreamConsumer<AggregatorContext>, KafkaError> {
    let consumer: StreamConsumer<AggregatorContext> =
        consumer_client_config(kafka_config, consumer_config)
            .create_with_context(AggregatorContext::new(liveness))?;
    consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;
    Ok(consumer)
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("dedup store rejected event {event_id} at {partition}/{offset}: {source}")]
    DedupRejected {
        partition: i32,
        offset: i64,
        event_id: String,
        source: DedupError,
    },
}

/// An event waiting for its dedup answer. While one is held after a failed
/// attempt, nothing is read past it.
struct HeldEvent {
    partition: i32,
    offset: i64,
    event: IngestionEvent,
    attempt: u32,
    retry_at: Instant,
}

impl HeldEvent {
    fn new(partition: i32, offset: i64, event: IngestionEvent) -> Self {
        Self {
            partition,
            offset,
            event,
            attempt: 0,
            retry_at: Instant::now(),
        }
    }
}

/// Feeds the events topic into an `Aggregator`, flushing every
/// `flush_interval` or as soon as enough keys are pending, and committing
/// the offsets each flush made safe.
pub struct AggregatorConsumer<D, C> {
    consumer: StreamConsumer<AggregatorContext>,
    topic: String,
    aggregator: Aggregator<D, C>,
    flush_interval: Duration,
    liveness: HealthHandle,
}

impl<D: DedupStore, C: CounterStore> AggregatorConsumer<D, C> {
    pub fn new(
        consumer: StreamConsumer<AggregatorContext>,
        topic: &str,
        aggregator: Aggregator<D, C>,
        flush_interval: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            consumer,
            topic: topic.to_owned(),
            aggregator,
            flush_interval,
            liveness,
        }
    }

    /// Consumes until `shutdown` resolves, then flushes and commits one last time.
    ///
    /// While the dedup store is unreachable the current event is held and
    /// retried on a timer, flushes and shutdown are still served. A dedup
    /// error that retrying cannot fix stops consumption: the final flush
    /// still runs, then the error is returned.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), ConsumerError> {
        let Self {
            consumer,
            topic,
            aggregator,
            flush_interval,
            liveness,
        } = self;

        let mut flush_tick = tokio::time::interval(*flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        flush_tick.tick().await;
        tokio::pin!(shutdown);

        let mut held: Option<HeldEvent> = None;
        let outcome = loop {
            liveness.report_healthy().await;
            let retry_at = held.as_ref().map_or_else(Instant::now, |h| h.retry_at);

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping consumption");
                    break Ok(());
                }
                _ = flush_tick.tick() => {
                    flush_and_commit(consumer, topic, aggregator, &mut held).await;
                }
                _ = sleep_until(retry_at), if held.is_some() => {
                    apply_revocations(consumer, aggregator, &mut held);
                    if let Some(event) = held.take() {
                        let observed =
                            observe_or_hold(consumer, topic, aggregator, &mut held, event).await;
                        if let Err(e) = observed {
                            break Err(e);
                        }
                    }
                }
                received = consumer.recv(), if held.is_none() => {
                    let (partition, offset, decoded) = match received {
                        Ok(message) => (
                            message.partition(),
                            message.offset(),
                            message.payload().map(serde_json::from_slice::<IngestionEvent>),
                        ),
                        Err(e) => {
                            error!("failed to receive from kafka: {}", e);
                            continue;
                        }
                    };
                    match decoded {
                        Some(Ok(event)) => {
                            let event = HeldEvent::new(partition, offset, event);
                            let observed =
                                observe_or_hold(consumer, topic, aggregator, &mut held, event)
                                    .await;
                            if let Err(e) = observed {
                                break Err(e);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(partition, offset, error = %e, "skipping undecodable event");
                            aggregator.skip(partition, offset);
                        }
                        None => {
                            warn!(partition, offset, "skipping empty message");
                            aggregator.skip(partition, offset);
                        }
                    }
                }
            }

            if aggregator.should_flush() {
                flush_and_commit(consumer, topic, aggregator, &mut held).await;
                flush_tick.reset();
            }
        };

        // A held event is not tracked, its offset is read again after a restart
        flush_and_commit(consumer, topic, aggregator, &mut held).await;
        if aggregator.pending_keys() > 0 {
            // Replay after restart recounts nothing: these events are already
            // in the dedup set, so the loss is an under-count
            error!(
                pending_keys = aggregator.pending_keys(),
                "exiting with unpersisted deltas"
            );
        }
        outcome
    }
}

/// Observes `event`, or keeps it in `held` with a later retry time when the
/// dedup store could not answer. The first failure flushes what was
/// accumulated so far, so an outage does not keep it pending.
async fn observe_or_hold<D: DedupStore, C: CounterStore>(
    consumer: &StreamConsumer<AggregatorContext>,
    topic: &str,
    aggregator: &mut Aggregator<D, C>,
    held: &mut Option<HeldEvent>,
    mut event: HeldEvent,
) -> Result<(), ConsumerError> {
    let no_labels: [(String, String); 0] = [];
    let today = Utc::now().date_naive();
    let err = match aggregator
        .observe(event.partition, event.offset, &event.event, today)
        .await
    {
        Ok(_) => {
            if event.attempt > 0 {
                info!(
                    partition = event.partition,
                    offset = event.offset,
                    attempts = event.attempt,
                    "dedup store answered, resuming consumption"
                );
            }
            return Ok(());
        }
        Err(e) => e,
    };

    if !err.is_transient() {
        error!(
            partition = event.partition,
            offset = event.offset,
            event_id = %event.event.event_id,
            error = %err,
            "dedup store rejected event, stopping consumption"
        );
        common_metrics::inc(DEDUP_REJECTED, &no_labels, 1);
        return Err(ConsumerError::DedupRejected {
            partition: event.partition,
            offset: event.offset,
            event_id: event.event.event_id,
            source: err,
        });
    }

    event.attempt += 1;
    let wait = aggregator.dedup_retry_interval(event.attempt);
    warn!(
        partition = event.partition,
        offset = event.offset,
        attempt = event.attempt,
        error = %err,
        "dedup store unavailable, holding event, retrying in {:?}",
        wait
    );
    common_metrics::inc(DEDUP_RETRIES, &no_labels, 1);
    event.retry_at = Instant::now() + wait;
    let first_failure = event.attempt == 1;
    *held = Some(event);

    if first_failure {
        flush_and_commit(consumer, topic, aggregator, held).await;
    }
    Ok(())
}

/// Drops the pending offsets of revoked partitions, and the held event if
/// its partition went to another consumer.
fn apply_revocations<D: DedupStore, C: CounterStore>(
    consumer: &StreamConsumer<AggregatorContext>,
    aggregator: &mut Aggregator<D, C>,
    held: &mut Option<HeldEvent>,
) {
    let revoked = consumer.context().take_revoked();
    if revoked.is_empty() {
        return;
    }
    aggregator.revoke(&revoked);

    if !held.as_ref().is_some_and(|h| revoked.contains(&h.partition)) {
        return;
    }
    if let Some(event) = held.take() {
        info!(
            partition = event.partition,
            offset = event.offset,
            "dropping held event of a revoked partition"
        );
    }
}

async fn flush_and_commit<D: DedupStore, C: CounterStore>(
    consumer: &StreamConsumer<AggregatorContext>,
    topic: &str,
    aggregator: &mut Aggregator<D, C>,
    held: &mut Option<HeldEvent>,
) {
    apply_revocations(consumer, aggregator, held);

    let result = aggregator.flush().await;
    if result.failed > 0 {
        warn!(
            applied = result.applied,
            failed = result.failed,
            "partial flush, failed keys are retried on the next flush"
        );
    }
    if result.commits.is_empty() {
        return;
    }

    let mut offsets = TopicPartitionList::new();
    for (partition, next_offset) in &result.commits {
        if let Err(e) = offsets.add_partition_offset(topic, *partition, Offset::Offset(*next_offset))
        {
            error!(partition, next_offset, "invalid offset to commit: {}", e);
        }
    }

    let no_labels: [(String, String); 0] = [];
    match consumer.commit(&offsets, CommitMode::Sync) {
        Ok(()) => {
            info!(
                applied = result.applied,
                partitions = result.commits.len(),
                "flushed and committed"
            );
            common_metrics::inc(OFFSETS_COMMITTED, &no_labels, result.commits.len() as u64);
        }
        Err(e) => {
            // Uncommitted offsets are replayed after a restart, the dedup set absorbs them
            error!("failed to commit offsets: {}", e);
            common_metrics::inc(COMMIT_FAILED, &no_labels, 1);
        }
    }
}
