pub const POLL_RUNS: &str = "topk_scheduler_poll_runs_total";
pub const POLL_TIME: &str = "topk_scheduler_poll_ms";
pub const CLAIMED_COUNT: &str = "topk_scheduler_claimed_total";
pub const PUBLISH_FAILED_COUNT: &str = "topk_scheduler_publish_failed_total";
pub const RECONCILED_COUNT: &str = "topk_scheduler_reconciled_total";
pub const RECONCILE_TIME: &str = "topk_scheduler_reconcile_ms";
pub const RETENTION_DELETED_COUNT: &str = "topk_scheduler_retention_deleted_total";
pub const RETENTION_TIME: &str = "topk_scheduler_retention_ms";
