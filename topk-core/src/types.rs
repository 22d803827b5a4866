use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a crawl schedule row. Rows cycle
/// idle -> enqueued -> running -> idle for the life of the user, and
/// reconciliation moves stale enqueued/running rows back to idle.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "schedule_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Waiting for next_run_at
    Idle,
    /// Claimed by a scheduler, a crawl job is on its way to a worker
    Enqueued,
    /// A worker is fetching for this row
    Running,
}

/// One row per (user_id, provider).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CrawlSchedule {
    pub user_id: String,
    pub provider: String,
    pub status: ScheduleStatus,
    pub next_run_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Consecutive failed crawls, reset by a successful one
    pub failed_attempts: i32,
    pub updated_at: DateTime<Utc>,
}

/// The message handed from the scheduler to an ingestion worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub user_id: String,
    pub provider: String,
    /// Unix seconds, fetch events that occurred at or after this instant
    pub since: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl CrawlJob {
    pub fn for_schedule(
        schedule: &CrawlSchedule,
        initial_lookback: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let since = schedule
            .last_success_at
            .unwrap_or_else(|| now - initial_lookback);
        CrawlJob {
            user_id: schedule.user_id.clone(),
            provider: schedule.provider.clone(),
            since: since.timestamp(),
            enqueued_at: now,
        }
    }
}

/// Key of an aggregate count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub user_id: String,
    pub day: NaiveDate,
    pub item_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub item_id: String,
    pub count: i64,
}
