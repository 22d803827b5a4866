use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::config::PoolConfig;
use crate::error::StoreError;
use crate::ops::schedule;
use crate::types::CrawlSchedule;

/// The control-plane store: crawl schedule rows and their state machine.
/// Cloning is cheap, clones share the pool.
#[derive(Clone)]
pub struct ScheduleStore {
    pool: PgPool,
}

impl ScheduleStore {
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn register(
        &self,
        user_id: &str,
        provider: &str,
        first_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        schedule::register(&self.pool, user_id, provider, first_run_at).await
    }

    pub async fn get(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<CrawlSchedule>, StoreError> {
        schedule::get(&self.pool, user_id, provider).await
    }

    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CrawlSchedule>, StoreError> {
        schedule::claim_due(&self.pool, now, limit).await
    }

    pub async fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, StoreError> {
        schedule::reconcile_stale(&self.pool, now, stale_after).await
    }

    pub async fn mark_running(
        &self,
        user_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CrawlSchedule>, StoreError> {
        schedule::mark_running(&self.pool, user_id, provider, now).await
    }

    pub async fn complete(
        &self,
        user_id: &str,
        provider: &str,
        now: DateTime<Utc>,
        period: Duration,
        fetched_through: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        schedule::complete(&self.pool, user_id, provider, now, period, fetched_through).await
    }

    pub async fn release(
        &self,
        user_id: &str,
        provider: &str,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        schedule::release(&self.pool, user_id, provider, now, retry_at).await
    }
}
