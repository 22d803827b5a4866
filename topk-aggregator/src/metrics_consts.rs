pub const EVENTS_COUNTED: &str = "topk_aggregator_events_counted";
pub const DUPLICATES_SKIPPED: &str = "topk_aggregator_duplicates_skipped";
pub const DEDUP_ERRORS: &str = "topk_aggregator_dedup_errors";
pub const DEDUP_RETRIES: &str = "topk_aggregator_dedup_retries";
// Dedup errors that retrying cannot fix, consumption stops on the first one
pub const DEDUP_REJECTED: &str = "topk_aggregator_dedup_rejected";
// Events counted without a dedup check, each one may be an over-count
pub const DEDUP_BYPASSED: &str = "topk_aggregator_dedup_bypassed_over_count_risk";
pub const MALFORMED_EVENTS: &str = "topk_aggregator_malformed_events";
pub const STALE_EVENTS: &str = "topk_aggregator_stale_events";
pub const PENDING_KEYS: &str = "topk_aggregator_pending_keys";
pub const FLUSH_TIME: &str = "topk_aggregator_flush_ms";
pub const FLUSH_KEYS_APPLIED: &str = "topk_aggregator_flush_keys_applied";
pub const FLUSH_KEYS_FAILED: &str = "topk_aggregator_flush_keys_failed";
pub const OFFSETS_COMMITTED: &str = "topk_aggregator_offsets_committed";
pub const COMMIT_FAILED: &str = "topk_aggregator_commit_failed";
pub const PARTITIONS_REVOKED: &str = "topk_aggregator_partitions_revoked";
