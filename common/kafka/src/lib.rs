pub mod config;
pub mod kafka_consumer;
pub mod kafka_producer;

/// Normalized consumption events, keyed by user_id.
pub const EVENTS_TOPIC: &str = "user.listen.raw";
/// Crawl jobs handed from the scheduler to the ingestion workers, keyed by user_id.
pub const CRAWL_JOBS_TOPIC: &str = "crawl_jobs";
