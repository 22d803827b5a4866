pub mod config;
pub mod counters;
pub mod dedup;
pub mod error;
pub mod event;
pub mod ops;
pub mod retry;
pub mod schedule;
pub mod test_utils;
pub mod types;

pub use config::PoolConfig;
pub use counters::{CounterStore, PgCounterStore};
pub use dedup::{DedupConfig, DedupStore, RedisDedupStore};
pub use error::{DedupError, StoreError};
pub use event::{dedup_namespace, day_bucket, EventError, IngestionEvent};
pub use retry::RetryPolicy;
pub use schedule::ScheduleStore;
pub use types::{CounterKey, CrawlJob, CrawlSchedule, DailyCount, ScheduleStatus};
