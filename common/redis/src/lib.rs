use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl CustomRedisError {
    /// Whether retrying the same command may succeed. Server replies such as
    /// a full bloom filter or a wrong key type fail the same way every time.
    pub fn is_transient(&self) -> bool {
        match self {
            CustomRedisError::Timeout => true,
            CustomRedisError::Redis(err) => {
                err.is_timeout()
                    || err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || matches!(
                        err.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            CustomRedisError::NotFound
            | CustomRedisError::InvalidConfiguration(_)
            | CustomRedisError::ParseError(_) => false,
        }
    }

    /// Builds a Redis error of the given kind, for tests.
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }
}

/// Parameters of a day-scoped bloom filter namespace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomParams {
    pub error_rate: f64,
    pub capacity: u64,
    /// Set once, when the filter is created
    pub ttl_seconds: u64,
}

#[async_trait]
pub trait Client {
    /// Returns `CustomRedisError::NotFound` for a missing key.
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;

    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;

    /// Adds `item` to the bloom filter at `k`, creating the filter with
    /// `params` if it does not exist yet. The expiry is only set if the key
    /// has none, so a namespace keeps the TTL it was created with.
    /// Returns true if the item was not present before.
    async fn bf_insert_expire_nx(
        &self,
        k: String,
        item: String,
        params: BloomParams,
    ) -> Result<bool, CustomRedisError>;
}
