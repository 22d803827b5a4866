use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use futures::stream::{self, StreamExt};
use topk_core::{
    dedup_namespace, CounterKey, CounterStore, DedupError, DedupStore, IngestionEvent,
    RetryPolicy,
};
use tracing::{debug, error, warn};

use crate::accumulator::Accumulator;
use crate::metrics_consts::*;

/// What to do when the dedup store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupFailureMode {
    /// Hand the error back so the event is held and retried with backoff.
    /// Its partition's offset does not move meanwhile.
    Retry,
    /// Count the event unchecked. It may be counted twice.
    CountAnyway,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDedupFailureModeError(String);

impl std::fmt::Display for ParseDedupFailureModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown dedup failure mode {:?}, expected retry or count", self.0)
    }
}

impl FromStr for DedupFailureMode {
    type Err = ParseDedupFailureModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(DedupFailureMode::Retry),
            "count" => Ok(DedupFailureMode::CountAnyway),
            _ => Err(ParseDedupFailureModeError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Pending keys that trigger a flush before the interval elapses
    pub flush_threshold: usize,
    /// Concurrent increments per flush
    pub flush_concurrency: usize,
    /// Events older than this many days are dropped. Must be shorter than the
    /// dedup namespace TTL, or their namespace may be gone already.
    pub dedup_window_days: u64,
    pub dedup_failure_mode: DedupFailureMode,
    pub dedup_retry_policy: RetryPolicy,
}

/// What `observe` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Counted,
    /// Already counted once, or a false positive of the dedup set
    Duplicate,
    Malformed,
    /// Older than the dedup window
    Stale,
    /// Counted without a dedup check, dedup store unreachable
    CountedWithoutDedup,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub applied: usize,
    pub failed: usize,
    /// (partition, next offset) pairs that are now safe to commit
    pub commits: Vec<(i32, i64)>,
}

/// The deduplicating aggregation engine of a single consumer.
///
/// Events go through `observe`: invalid and stale events are dropped, the
/// event id is added to the shared dedup set of its day, and only ids that
/// were absent are counted in the accumulator. `flush` persists the
/// accumulated deltas and reports which offsets can be committed. A
/// partition's offset is reported only when every delta accumulated up to it
/// was persisted, failed deltas are carried over to the next flush along with
/// the offset they hold back.
pub struct Aggregator<D, C> {
    dedup: D,
    counters: C,
    settings: AggregatorSettings,
    accumulator: Accumulator,
    metrics_labels: Vec<(String, String)>,
}

enum DedupVerdict {
    New,
    Seen,
    Bypassed,
}

impl<D: DedupStore, C: CounterStore> Aggregator<D, C> {
    pub fn new(dedup: D, counters: C, settings: AggregatorSettings) -> Self {
        Self {
            dedup,
            counters,
            settings,
            accumulator: Accumulator::new(),
            metrics_labels: vec![],
        }
    }

    /// Handles the event read at `offset` of `partition`. `today` is the
    /// current UTC day, the reference of the dedup window.
    ///
    /// Makes a single dedup call and never waits. In `Retry` mode a dedup
    /// error is returned as is: nothing was counted and the offset was not
    /// tracked, so the caller must observe the same event again before
    /// moving on to the rest of its partition.
    pub async fn observe(
        &mut self,
        partition: i32,
        offset: i64,
        event: &IngestionEvent,
        today: NaiveDate,
    ) -> Result<Observation, DedupError> {
        let day = match event.validate() {
            Ok(day) => day,
            Err(e) => {
                warn!(partition, offset, error = %e, "skipping malformed event");
                common_metrics::inc(MALFORMED_EVENTS, &self.metrics_labels, 1);
                self.accumulator.track_offset(partition, offset);
                return Ok(Observation::Malformed);
            }
        };

        let oldest = today
            .checked_sub_days(Days::new(self.settings.dedup_window_days))
            .unwrap_or(NaiveDate::MIN);
        if day < oldest {
            warn!(
                partition,
                offset,
                event_id = %event.event_id,
                %day,
                "dropping event older than the dedup window"
            );
            common_metrics::inc(STALE_EVENTS, &self.metrics_labels, 1);
            self.accumulator.track_offset(partition, offset);
            return Ok(Observation::Stale);
        }

        let verdict = self
            .check_dedup(&dedup_namespace(day), &event.event_id)
            .await?;
        self.accumulator.track_offset(partition, offset);
        if matches!(verdict, DedupVerdict::Seen) {
            debug!(event_id = %event.event_id, "skipping duplicate event");
            common_metrics::inc(DUPLICATES_SKIPPED, &self.metrics_labels, 1);
            return Ok(Observation::Duplicate);
        }

        let key = CounterKey {
            user_id: event.user_id.clone(),
            day,
            item_id: event.item_id.clone(),
        };
        self.accumulator.add(partition, key, 1);
        common_metrics::inc(EVENTS_COUNTED, &self.metrics_labels, 1);

        Ok(match verdict {
            DedupVerdict::Bypassed => Observation::CountedWithoutDedup,
            _ => Observation::Counted,
        })
    }

    /// Handles a message that could not even be decoded: nothing to count,
    /// but its offset advances like any other.
    pub fn skip(&mut self, partition: i32, offset: i64) {
        self.accumulator.track_offset(partition, offset);
        common_metrics::inc(MALFORMED_EVENTS, &self.metrics_labels, 1);
    }

    async fn check_dedup(
        &self,
        namespace: &str,
        event_id: &str,
    ) -> Result<DedupVerdict, DedupError> {
        let err = match self.dedup.add_if_absent(namespace, event_id).await {
            Ok(true) => return Ok(DedupVerdict::New),
            Ok(false) => return Ok(DedupVerdict::Seen),
            Err(e) => e,
        };
        common_metrics::inc(DEDUP_ERRORS, &self.metrics_labels, 1);

        match self.settings.dedup_failure_mode {
            DedupFailureMode::CountAnyway => {
                warn!(
                    %namespace,
                    %event_id,
                    error = %err,
                    "dedup store failed, counting without dedup: over-count risk"
                );
                common_metrics::inc(DEDUP_BYPASSED, &self.metrics_labels, 1);
                Ok(DedupVerdict::Bypassed)
            }
            DedupFailureMode::Retry => Err(err),
        }
    }

    /// Wait before observing a held event again, `attempt` counting from 1.
    pub fn dedup_retry_interval(&self, attempt: u32) -> Duration {
        self.settings.dedup_retry_policy.retry_interval(attempt)
    }

    pub fn pending_keys(&self) -> usize {
        self.accumulator.pending_keys()
    }

    pub fn should_flush(&self) -> bool {
        self.accumulator.pending_keys() >= self.settings.flush_threshold
    }

    /// Drops the pending offsets of partitions revoked from this consumer.
    pub fn revoke(&mut self, partitions: &[i32]) {
        for partition in partitions {
            self.accumulator.forget_offset(*partition);
        }
        common_metrics::inc(
            PARTITIONS_REVOKED,
            &self.metrics_labels,
            partitions.len() as u64,
        );
    }

    /// Persists everything accumulated so far and returns the offsets that
    /// became safe to commit.
    pub async fn flush(&mut self) -> FlushResult {
        let mut result = FlushResult::default();
        if self.accumulator.is_empty() {
            return result;
        }
        let _time = common_metrics::timing_guard(FLUSH_TIME, &self.metrics_labels);

        for drained in self.accumulator.drain() {
            let counters = &self.counters;
            let outcomes: Vec<_> = stream::iter(drained.deltas)
                .map(|(key, delta)| async move {
                    let outcome = counters.increment(&key, delta).await;
                    (key, delta, outcome)
                })
                .buffer_unordered(self.settings.flush_concurrency.max(1))
                .collect()
                .await;

            let mut failed = HashMap::new();
            for (key, delta, outcome) in outcomes {
                match outcome {
                    Ok(()) => result.applied += 1,
                    Err(e) => {
                        error!(
                            partition = drained.partition,
                            user_id = %key.user_id,
                            day = %key.day,
                            item_id = %key.item_id,
                            delta,
                            error = %e,
                            "failed to persist delta, retrying on next flush"
                        );
                        failed.insert(key, delta);
                    }
                }
            }

            if failed.is_empty() {
                if let Some(next_offset) = drained.next_offset {
                    result.commits.push((drained.partition, next_offset));
                }
            } else {
                result.failed += failed.len();
                self.accumulator
                    .restore(drained.partition, failed, drained.next_offset);
            }
        }

        common_metrics::inc(FLUSH_KEYS_APPLIED, &self.metrics_labels, result.applied as u64);
        common_metrics::inc(FLUSH_KEYS_FAILED, &self.metrics_labels, result.failed as u64);
        common_metrics::gauge(
            PENDING_KEYS,
            &self.metrics_labels,
            self.accumulator.pending_keys() as f64,
        );
        result
    }
}
