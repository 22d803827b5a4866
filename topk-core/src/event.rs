use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A normalized "item consumed" event, as published on the events topic.
/// `event_id` is the idempotency key assigned by the provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionEvent {
    pub event_id: String,
    pub user_id: String,
    pub item_id: String,
    pub provider: String,
    /// Unix seconds
    pub occurred_at: i64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("occurred_at {0} is out of range")]
    InvalidTimestamp(i64),
}

impl IngestionEvent {
    /// Checks the event can be counted and returns its day bucket.
    pub fn validate(&self) -> Result<NaiveDate, EventError> {
        for (name, value) in [
            ("event_id", &self.event_id),
            ("user_id", &self.user_id),
            ("item_id", &self.item_id),
            ("provider", &self.provider),
        ] {
            if value.trim().is_empty() {
                return Err(EventError::MissingField(name));
            }
        }
        day_bucket(self.occurred_at).ok_or(EventError::InvalidTimestamp(self.occurred_at))
    }
}

/// The UTC calendar day containing `occurred_at`.
pub fn day_bucket(occurred_at: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(occurred_at, 0).map(|ts| ts.date_naive())
}

/// Name of the shared dedup set holding the event ids of `day`.
pub fn dedup_namespace(day: NaiveDate) -> String {
    format!("dedup:{}", day.format("%Y-%m-%d"))
}
