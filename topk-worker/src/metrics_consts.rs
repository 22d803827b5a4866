pub const JOBS_RECEIVED: &str = "topk_worker_jobs_received";
pub const JOBS_COMPLETED: &str = "topk_worker_jobs_completed";
pub const JOBS_SKIPPED: &str = "topk_worker_jobs_skipped";
pub const JOBS_RELEASED: &str = "topk_worker_jobs_released";
pub const JOBS_UNDECODABLE: &str = "topk_worker_jobs_undecodable";
pub const JOB_TIME: &str = "topk_worker_job_ms";
pub const EVENTS_PUBLISHED: &str = "topk_worker_events_published";
pub const WORKER_SATURATION: &str = "topk_worker_saturation_percent";
