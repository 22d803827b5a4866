use chrono::NaiveDate;

use crate::error::StoreError;
use crate::types::{CounterKey, DailyCount};

/// Atomically adds `delta` to the count at `key`, creating the row on first
/// increment. Concurrent increments of the same key never lose an update.
pub async fn increment<'c, E>(executor: E, key: &CounterKey, delta: i64) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    if delta <= 0 {
        return Err(StoreError::InvalidDelta {
            user_id: key.user_id.clone(),
            day: key.day,
            item_id: key.item_id.clone(),
            delta,
        });
    }

    sqlx::query(
        r#"
INSERT INTO daily_item_counts (user_id, day, item_id, count, updated_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (user_id, day, item_id)
DO UPDATE SET count = daily_item_counts.count + EXCLUDED.count, updated_at = NOW()
        "#,
    )
    .bind(&key.user_id)
    .bind(key.day)
    .bind(&key.item_id)
    .bind(delta)
    .execute(executor)
    .await
    .map_err(|e| StoreError::query("INSERT", e))?;

    Ok(())
}

/// Every (day, item) count of `user_id` over `days`. Days without any row are
/// simply absent from the result.
pub async fn counts_for_days<'c, E>(
    executor: E,
    user_id: &str,
    days: &[NaiveDate],
) -> Result<Vec<DailyCount>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, DailyCount>(
        r#"
SELECT day, item_id, count
FROM daily_item_counts
WHERE user_id = $1 AND day = ANY($2)
        "#,
    )
    .bind(user_id)
    .bind(days)
    .fetch_all(executor)
    .await
    .map_err(|e| StoreError::query("SELECT", e))
}

/// Retention: drops every count of a day strictly before `cutoff`.
pub async fn delete_before<'c, E>(executor: E, cutoff: NaiveDate) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query("DELETE FROM daily_item_counts WHERE day < $1")
        .bind(cutoff)
        .execute(executor)
        .await
        .map_err(|e| StoreError::query("DELETE", e))?;

    Ok(result.rows_affected())
}
