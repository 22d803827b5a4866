//! In-memory delta counters, one arena per consumed partition.
//!
//! The accumulator is owned by the consuming task and is never shared: the
//! flush takes its whole content with `drain`, which leaves an empty
//! accumulator behind, so accumulation and flushing never see each other's
//! partial state.
use std::collections::HashMap;

use topk_core::CounterKey;

#[derive(Debug, Default)]
struct PartitionAccumulator {
    deltas: HashMap<CounterKey, i64>,
    /// Offset to commit once every delta of this partition is persisted
    next_offset: Option<i64>,
}

/// Everything accumulated for one partition since the previous drain.
#[derive(Debug, PartialEq, Eq)]
pub struct DrainedPartition {
    pub partition: i32,
    pub deltas: HashMap<CounterKey, i64>,
    pub next_offset: Option<i64>,
}

#[derive(Debug, Default)]
pub struct Accumulator {
    partitions: HashMap<i32, PartitionAccumulator>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, partition: i32, key: CounterKey, delta: i64) {
        *self
            .partitions
            .entry(partition)
            .or_default()
            .deltas
            .entry(key)
            .or_insert(0) += delta;
    }

    /// Records that the message at `offset` has been handled, counted or not.
    pub fn track_offset(&mut self, partition: i32, offset: i64) {
        let next = &mut self.partitions.entry(partition).or_default().next_offset;
        *next = Some(next.map_or(offset + 1, |current| current.max(offset + 1)));
    }

    /// Number of distinct keys waiting for the next flush.
    pub fn pending_keys(&self) -> usize {
        self.partitions.values().map(|p| p.deltas.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions
            .values()
            .all(|p| p.deltas.is_empty() && p.next_offset.is_none())
    }

    /// Takes everything accumulated so far, leaving the accumulator empty.
    pub fn drain(&mut self) -> Vec<DrainedPartition> {
        let mut drained: Vec<DrainedPartition> = std::mem::take(&mut self.partitions)
            .into_iter()
            .map(|(partition, acc)| DrainedPartition {
                partition,
                deltas: acc.deltas,
                next_offset: acc.next_offset,
            })
            .collect();
        drained.sort_by_key(|p| p.partition);
        drained
    }

    /// Merges deltas that could not be persisted back in, together with the
    /// offset they were holding back. That offset is only committed once a
    /// later flush persists them.
    pub fn restore(
        &mut self,
        partition: i32,
        deltas: impl IntoIterator<Item = (CounterKey, i64)>,
        next_offset: Option<i64>,
    ) {
        let acc = self.partitions.entry(partition).or_default();
        for (key, delta) in deltas {
            *acc.deltas.entry(key).or_insert(0) += delta;
        }
        if let Some(carried) = next_offset {
            acc.next_offset = Some(acc.next_offset.map_or(carried, |o| o.max(carried)));
        }
    }

    /// Drops the pending offset of a partition this instance no longer owns.
    /// Its deltas stay: they were deduplicated and still have to be persisted.
    pub fn forget_offset(&mut self, partition: i32) {
        if let Some(acc) = self.partitions.get_mut(&partition) {
            acc.next_offset = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use topk_core::test_utils::key;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
    }

    #[test]
    fn deltas_merge_per_key() {
        let mut acc = Accumulator::new();
        acc.add(0, key("u1", day(), "a"), 1);
        acc.add(0, key("u1", day(), "a"), 1);
        acc.add(0, key("u1", day(), "b"), 1);
        acc.add(1, key("u2", day(), "a"), 1);

        assert_eq!(acc.pending_keys(), 3);

        let drained = acc.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].partition, 0);
        assert_eq!(drained[0].deltas[&key("u1", day(), "a")], 2);
        assert_eq!(drained[0].deltas[&key("u1", day(), "b")], 1);
        assert_eq!(drained[1].deltas[&key("u2", day(), "a")], 1);
    }

    #[test]
    fn drain_leaves_empty_accumulator() {
        let mut acc = Accumulator::new();
        acc.add(0, key("u1", day(), "a"), 1);
        acc.track_offset(0, 10);

        assert!(!acc.is_empty());
        let drained = acc.drain();
        assert_eq!(drained[0].next_offset, Some(11));

        assert!(acc.is_empty());
        assert_eq!(acc.pending_keys(), 0);
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn offsets_only_move_forward() {
        let mut acc = Accumulator::new();
        acc.track_offset(3, 7);
        acc.track_offset(3, 5);
        acc.track_offset(3, 9);
        acc.track_offset(3, 8);

        let drained = acc.drain();
        assert_eq!(drained[0].next_offset, Some(10));
        // Offsets alone make a partition worth draining
        assert!(drained[0].deltas.is_empty());
    }

    #[test]
    fn restore_merges_with_new_deltas() {
        let mut acc = Accumulator::new();
        acc.add(0, key("u1", day(), "a"), 2);
        acc.track_offset(0, 4);
        let mut drained = acc.drain();

        // Meanwhile, more arrives for the same key
        acc.add(0, key("u1", day(), "a"), 1);
        acc.track_offset(0, 6);

        let failed = drained.remove(0);
        acc.restore(failed.partition, failed.deltas, failed.next_offset);

        let drained = acc.drain();
        assert_eq!(drained[0].deltas[&key("u1", day(), "a")], 3);
        assert_eq!(drained[0].next_offset, Some(7));
    }

    #[test]
    fn restore_carries_offset_into_empty_partition() {
        let mut acc = Accumulator::new();
        acc.restore(2, [(key("u1", day(), "a"), 4)], Some(12));

        let drained = acc.drain();
        assert_eq!(
            drained,
            vec![DrainedPartition {
                partition: 2,
                deltas: HashMap::from([(key("u1", day(), "a"), 4)]),
                next_offset: Some(12),
            }]
        );
    }

    #[test]
    fn forgotten_offset_keeps_deltas() {
        let mut acc = Accumulator::new();
        acc.add(0, key("u1", day(), "a"), 1);
        acc.track_offset(0, 3);
        acc.track_offset(1, 8);

        acc.forget_offset(0);
        // Unknown partitions are ignored
        acc.forget_offset(5);

        let drained = acc.drain();
        assert_eq!(drained[0].next_offset, None);
        assert_eq!(drained[0].deltas[&key("u1", day(), "a")], 1);
        assert_eq!(drained[1].next_offset, Some(9));
    }
}
