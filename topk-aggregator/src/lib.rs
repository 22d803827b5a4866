pub mod accumulator;
pub mod aggregator;
pub mod config;
pub mod consumer;
pub mod metrics_consts;
