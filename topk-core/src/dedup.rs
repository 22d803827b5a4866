use std::sync::Arc;

use async_trait::async_trait;
use common_redis::{BloomParams, Client};

use crate::error::DedupError;

/// The shared, cross-instance set of already counted event ids.
///
/// Implementations must never report an added key as absent (no false
/// negatives). Reporting an unseen key as present is tolerated: the event is
/// skipped and the count is low by one, which is the only error this pipeline
/// accepts.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically adds `key` to `namespace`. Returns true if it was not there before.
    async fn add_if_absent(&self, namespace: &str, key: &str) -> Result<bool, DedupError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    pub error_rate: f64,
    pub capacity: u64,
    /// Lifetime of a day namespace, counted from its creation
    pub namespace_ttl: std::time::Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            error_rate: 0.001,
            capacity: 10_000_000,
            namespace_ttl: std::time::Duration::from_secs(8 * 24 * 3600),
        }
    }
}

/// One RedisBloom filter per namespace. Each filter is created on first
/// insert with the configured capacity and error rate, and expires
/// `namespace_ttl` after creation.
pub struct RedisDedupStore {
    client: Arc<dyn Client + Send + Sync>,
    params: BloomParams,
}

impl RedisDedupStore {
    pub fn new(client: Arc<dyn Client + Send + Sync>, config: DedupConfig) -> Self {
        RedisDedupStore {
            client,
            params: BloomParams {
                error_rate: config.error_rate,
                capacity: config.capacity,
                ttl_seconds: config.namespace_ttl.as_secs(),
            },
        }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn add_if_absent(&self, namespace: &str, key: &str) -> Result<bool, DedupError> {
        let added = self
            .client
            .bf_insert_expire_nx(namespace.to_string(), key.to_string(), self.params)
            .await?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::{CustomRedisError, MockRedisClient, MockRedisValue};

    #[tokio::test]
    async fn second_add_reports_present() {
        let redis = MockRedisClient::new();
        let store = RedisDedupStore::new(Arc::new(redis.clone()), DedupConfig::default());

        assert!(store.add_if_absent("dedup:2024-03-02", "e1").await.unwrap());
        assert!(!store.add_if_absent("dedup:2024-03-02", "e1").await.unwrap());
        assert!(store.add_if_absent("dedup:2024-03-02", "e2").await.unwrap());

        let calls = redis.get_calls();
        assert_eq!(calls.len(), 3);
        match &calls[0].value {
            MockRedisValue::BloomItem(item, params) => {
                assert_eq!(item, "e1");
                assert_eq!(params.capacity, 10_000_000);
                assert_eq!(params.ttl_seconds, 691_200);
            }
            other => panic!("unexpected call value {other:?}"),
        }
    }

    #[tokio::test]
    async fn redis_failure_is_surfaced() {
        let redis = MockRedisClient::new().bf_insert_error(CustomRedisError::Timeout);
        let store = RedisDedupStore::new(Arc::new(redis), DedupConfig::default());

        assert!(matches!(
            store.add_if_absent("dedup:2024-03-02", "e1").await,
            Err(DedupError::Unavailable(CustomRedisError::Timeout))
        ));
    }

    #[tokio::test]
    async fn full_filter_is_not_retryable() {
        let full = CustomRedisError::from_redis_kind(
            redis::ErrorKind::ResponseError,
            "ERR non scaling filter is full",
        );
        let redis = MockRedisClient::new().bf_insert_error(full);
        let store = RedisDedupStore::new(Arc::new(redis), DedupConfig::default());

        let err = store
            .add_if_absent("dedup:2024-03-02", "e1")
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::Rejected(_)));
        assert!(!err.is_transient());
    }
}
