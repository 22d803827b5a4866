pub const TOPK_REQUESTS: &str = "topk_api_requests_total";
pub const TOPK_REJECTED: &str = "topk_api_rejected_requests_total";
pub const CACHE_HITS: &str = "topk_api_cache_hits_total";
pub const CACHE_MISSES: &str = "topk_api_cache_misses_total";
// Labelled with op=read|write
pub const CACHE_ERRORS: &str = "topk_api_cache_errors_total";
pub const QUERY_TIME: &str = "topk_api_query_compute_ms";
