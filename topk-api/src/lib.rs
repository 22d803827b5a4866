pub mod api;
pub mod config;
pub mod metrics_consts;
pub mod router;
pub mod server;
pub mod topk;
