//! In-memory stores for exercising the engines without Postgres or Redis.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::counters::CounterStore;
use crate::dedup::DedupStore;
use crate::error::{DedupError, StoreError};
use crate::types::{CounterKey, DailyCount};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn injected(command: &str) -> StoreError {
    StoreError::query(command, sqlx::Error::PoolTimedOut)
}

/// Clones share state, so a test can keep a handle on a store it moved into an engine.
#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    counts: Arc<Mutex<HashMap<CounterKey, i64>>>,
    failing_keys: Arc<Mutex<HashSet<CounterKey>>>,
    failing_reads: Arc<AtomicBool>,
    increments: Arc<AtomicUsize>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: &str, day: NaiveDate, item_id: &str, count: i64) {
        lock(&self.counts).insert(key(user_id, day, item_id), count);
    }

    pub fn get(&self, user_id: &str, day: NaiveDate, item_id: &str) -> i64 {
        lock(&self.counts)
            .get(&key(user_id, day, item_id))
            .copied()
            .unwrap_or(0)
    }

    /// Increments of `key` fail until `heal` is called.
    pub fn fail_key(&self, key: CounterKey) {
        lock(&self.failing_keys).insert(key);
    }

    pub fn heal(&self) {
        lock(&self.failing_keys).clear();
        self.failing_reads.store(false, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.failing_reads.store(true, Ordering::SeqCst);
    }

    /// Number of successful increments so far.
    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> HashMap<CounterKey, i64> {
        lock(&self.counts).clone()
    }
}

pub fn key(user_id: &str, day: NaiveDate, item_id: &str) -> CounterKey {
    CounterKey {
        user_id: user_id.to_string(),
        day,
        item_id: item_id.to_string(),
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &CounterKey, delta: i64) -> Result<(), StoreError> {
        if lock(&self.failing_keys).contains(key) {
            return Err(injected("INSERT"));
        }
        if delta <= 0 {
            return Err(StoreError::InvalidDelta {
                user_id: key.user_id.clone(),
                day: key.day,
                item_id: key.item_id.clone(),
                delta,
            });
        }
        *lock(&self.counts).entry(key.clone()).or_insert(0) += delta;
        self.increments.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn counts_for_days(
        &self,
        user_id: &str,
        days: &[NaiveDate],
    ) -> Result<Vec<DailyCount>, StoreError> {
        if self.failing_reads.load(Ordering::SeqCst) {
            return Err(injected("SELECT"));
        }
        Ok(lock(&self.counts)
            .iter()
            .filter(|(key, _)| key.user_id == user_id && days.contains(&key.day))
            .map(|(key, count)| DailyCount {
                day: key.day,
                item_id: key.item_id.clone(),
                count: *count,
            })
            .collect())
    }
}

/// An exact set per namespace, so it never produces false positives.
#[derive(Clone, Default)]
pub struct MemoryDedupStore {
    namespaces: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    unavailable: Arc<AtomicBool>,
    rejecting: Arc<AtomicBool>,
    failures_left: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails until `recover` is called.
    pub fn go_down(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
    }

    /// Every call fails with a permanent error, like a full filter.
    pub fn reject_all(&self) {
        self.rejecting.store(true, Ordering::SeqCst);
    }

    /// Calls made so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The next `times` calls fail.
    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        lock(&self.namespaces)
            .get(namespace)
            .is_some_and(|set| set.contains(key))
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn add_if_absent(&self, namespace: &str, key: &str) -> Result<bool, DedupError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(DedupError::Rejected(
                common_redis::CustomRedisError::InvalidConfiguration(
                    "non scaling filter is full".to_string(),
                ),
            ));
        }
        let transient = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if transient || self.unavailable.load(Ordering::SeqCst) {
            return Err(DedupError::Unavailable(
                common_redis::CustomRedisError::Timeout,
            ));
        }
        Ok(lock(&self.namespaces)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string()))
    }
}
