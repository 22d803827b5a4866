use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;

use crate::config::PoolConfig;
use crate::error::StoreError;
use crate::ops::counters;
use crate::types::{CounterKey, DailyCount};

/// Keyed atomic-increment storage for per (user, day, item) counts.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically adds a strictly positive `delta` to `key`.
    async fn increment(&self, key: &CounterKey, delta: i64) -> Result<(), StoreError>;

    /// All recorded counts of `user_id` over `days`. Missing days or items are
    /// absent, not errors.
    async fn counts_for_days(
        &self,
        user_id: &str,
        days: &[NaiveDate],
    ) -> Result<Vec<DailyCount>, StoreError>;
}

#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub async fn new(config: PoolConfig) -> Result<Self, StoreError> {
        let pool = config
            .connect()
            .await
            .map_err(|error| StoreError::PoolCreationError { error })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes counts of days before `cutoff`. Postgres rows carry no TTL, so
    /// retention is enforced by calling this periodically.
    pub async fn delete_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        counters::delete_before(&self.pool, cutoff).await
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(&self, key: &CounterKey, delta: i64) -> Result<(), StoreError> {
        counters::increment(&self.pool, key, delta).await
    }

    async fn counts_for_days(
        &self,
        user_id: &str,
        days: &[NaiveDate],
    ) -> Result<Vec<DailyCount>, StoreError> {
        counters::counts_for_days(&self.pool, user_id, days).await
    }
}
