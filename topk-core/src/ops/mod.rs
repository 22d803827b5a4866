pub mod counters;
pub mod schedule;
