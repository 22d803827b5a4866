use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::types::CrawlSchedule;

// Every state transition below is a single conditional UPDATE. The status
// predicate in the WHERE clause is the compare-and-swap: a row whose status
// changed underneath us is simply not touched, and the caller learns it from
// the affected row count.

/// Creates the schedule row for a newly onboarded (user, provider) pair.
/// Returns false if the row already exists, in which case it is left untouched.
pub async fn register<'c, E>(
    executor: E,
    user_id: &str,
    provider: &str,
    first_run_at: DateTime<Utc>,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
INSERT INTO crawl_schedules (user_id, provider, status, next_run_at, created_at, updated_at)
VALUES ($1, $2, 'idle', $3, NOW(), NOW())
ON CONFLICT (user_id, provider) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .bind(first_run_at)
    .execute(executor)
    .await
    .map_err(|e| StoreError::query("INSERT", e))?;

    Ok(result.rows_affected() == 1)
}

pub async fn get<'c, E>(
    executor: E,
    user_id: &str,
    provider: &str,
) -> Result<Option<CrawlSchedule>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, CrawlSchedule>(
        r#"
SELECT user_id, provider, status, next_run_at, last_success_at, failed_attempts, updated_at
FROM crawl_schedules
WHERE user_id = $1 AND provider = $2
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .fetch_optional(executor)
    .await
    .map_err(|e| StoreError::query("SELECT", e))
}

/// Claims up to `limit` idle rows that are due at `now`, moving them to
/// enqueued. Rows locked by a concurrent claimer are skipped rather than
/// waited on, so two schedulers never return the same row.
pub async fn claim_due<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<CrawlSchedule>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, CrawlSchedule>(
        r#"
WITH due AS (
    SELECT user_id, provider
    FROM crawl_schedules
    WHERE status = 'idle' AND next_run_at <= $1
    ORDER BY next_run_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE crawl_schedules
SET status = 'enqueued', updated_at = $1
FROM due
WHERE crawl_schedules.user_id = due.user_id
    AND crawl_schedules.provider = due.provider
    AND crawl_schedules.status = 'idle'
RETURNING crawl_schedules.user_id, crawl_schedules.provider, crawl_schedules.status,
    crawl_schedules.next_run_at, crawl_schedules.last_success_at,
    crawl_schedules.failed_attempts, crawl_schedules.updated_at
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await
    .map_err(|e| StoreError::query("UPDATE", e))
}

/// Moves enqueued or running rows whose last transition is older than
/// `stale_after` back to idle, due immediately. Returns the number of rows reset.
pub async fn reconcile_stale<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
WITH stale AS (
    SELECT user_id, provider
    FROM crawl_schedules
    WHERE status IN ('enqueued', 'running') AND updated_at <= $2
    FOR UPDATE SKIP LOCKED
)
UPDATE crawl_schedules
SET status = 'idle', next_run_at = $1, updated_at = $1
FROM stale
WHERE crawl_schedules.user_id = stale.user_id
    AND crawl_schedules.provider = stale.provider
    AND crawl_schedules.status IN ('enqueued', 'running')
        "#,
    )
    .bind(now)
    .bind(now - stale_after)
    .execute(executor)
    .await
    .map_err(|e| StoreError::query("UPDATE", e))?;

    Ok(result.rows_affected())
}

/// enqueued -> running, done by the worker before fetching. Returns the
/// running row, or None if the row is not enqueued anymore (duplicate job, or
/// reconciled meanwhile).
pub async fn mark_running<'c, E>(
    executor: E,
    user_id: &str,
    provider: &str,
    now: DateTime<Utc>,
) -> Result<Option<CrawlSchedule>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, CrawlSchedule>(
        r#"
UPDATE crawl_schedules
SET status = 'running', updated_at = $3
WHERE user_id = $1 AND provider = $2 AND status = 'enqueued'
RETURNING user_id, provider, status, next_run_at, last_success_at, failed_attempts, updated_at
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .bind(now)
    .fetch_optional(executor)
    .await
    .map_err(|e| StoreError::query("UPDATE", e))
}

/// running -> idle after a successful crawl. `fetched_through` becomes the
/// `since` of the next job.
pub async fn complete<'c, E>(
    executor: E,
    user_id: &str,
    provider: &str,
    now: DateTime<Utc>,
    period: Duration,
    fetched_through: DateTime<Utc>,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE crawl_schedules
SET status = 'idle', next_run_at = $3, last_success_at = $4, failed_attempts = 0, updated_at = $5
WHERE user_id = $1 AND provider = $2 AND status = 'running'
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .bind(now + period)
    .bind(fetched_through)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| StoreError::query("UPDATE", e))?;

    Ok(result.rows_affected() == 1)
}

/// running -> idle after a failed crawl, due again at `retry_at`. Bumps
/// `failed_attempts`.
pub async fn release<'c, E>(
    executor: E,
    user_id: &str,
    provider: &str,
    now: DateTime<Utc>,
    retry_at: DateTime<Utc>,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE crawl_schedules
SET status = 'idle', next_run_at = $3, failed_attempts = failed_attempts + 1, updated_at = $4
WHERE user_id = $1 AND provider = $2 AND status = 'running'
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .bind(retry_at)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| StoreError::query("UPDATE", e))?;

    Ok(result.rows_affected() == 1)
}
