pub mod config;
pub mod error;
pub mod metrics_consts;
pub mod provider;
pub mod worker;
