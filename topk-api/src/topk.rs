//! Read-through Top-K computation over the daily item counts.
//!
//! Results are cached per `(user, days, k)` for a fixed TTL and never
//! invalidated on write: a cached answer can lag the counters by up to the
//! TTL. The cache is strictly optional, any failure to read or write it
//! falls back to computing from the counter store.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use common_redis::{Client as RedisClient, CustomRedisError};
use topk_core::{CounterStore, DailyCount};
use tracing::warn;

use crate::api::errors::ApiError;
use crate::api::types::{RankedItem, TopKResponse};
use crate::metrics_consts::*;

/// Where "today" comes from.
pub trait TimeSource: Send + Sync {
    fn today(&self) -> NaiveDate;
}

pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Always the same day, for tests.
pub struct FixedTimeSource(pub NaiveDate);

impl TimeSource for FixedTimeSource {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

pub fn cache_key(user_id: &str, days: u32, k: u32) -> String {
    format!("topk:{user_id}:{days}:{k}")
}

/// The `days` most recent UTC day buckets, today included, newest first.
pub fn day_range(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..u64::from(days))
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .collect()
}

/// Sums counts per item, orders by total descending then item id ascending,
/// and keeps the first `k`. Ranks start at 1.
pub fn rank_items(counts: impl IntoIterator<Item = DailyCount>, k: usize) -> Vec<RankedItem> {
    let mut totals: HashMap<String, i64> = HashMap::new();
    for count in counts {
        *totals.entry(count.item_id).or_insert(0) += count.count;
    }

    let mut totals: Vec<(String, i64)> = totals.into_iter().collect();
    totals.sort_by(|(a_item, a_count), (b_item, b_count)| {
        b_count.cmp(a_count).then_with(|| a_item.cmp(b_item))
    });

    totals
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(index, (item_id, count))| RankedItem {
            item_id,
            count,
            rank: index + 1,
        })
        .collect()
}

pub struct TopKEngine {
    counters: Arc<dyn CounterStore>,
    cache: Arc<dyn RedisClient + Send + Sync>,
    time: Arc<dyn TimeSource>,
    cache_ttl_seconds: u64,
}

impl TopKEngine {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        cache: Arc<dyn RedisClient + Send + Sync>,
        time: Arc<dyn TimeSource>,
        cache_ttl_seconds: u64,
    ) -> Self {
        Self {
            counters,
            cache,
            time,
            cache_ttl_seconds,
        }
    }

    /// `days` and `k` must already be validated.
    pub async fn top_k(&self, user_id: &str, days: u32, k: u32) -> Result<TopKResponse, ApiError> {
        let key = cache_key(user_id, days, k);

        if let Some(mut response) = self.read_cache(&key).await {
            common_metrics::inc(CACHE_HITS, &[], 1);
            response.cached = true;
            return Ok(response);
        }
        common_metrics::inc(CACHE_MISSES, &[], 1);

        let timer = common_metrics::timing_guard(QUERY_TIME, &[]);
        let response = self.compute(user_id, days, k).await?;
        timer.fin();

        match serde_json::to_string(&response) {
            Ok(payload) => {
                if let Err(e) = self.cache.setex(key, payload, self.cache_ttl_seconds).await {
                    warn!(user_id, error = %e, "failed to populate topk cache");
                    common_metrics::inc(CACHE_ERRORS, &[("op".to_string(), "write".to_string())], 1);
                }
            }
            Err(e) => warn!(user_id, error = %e, "failed to serialize topk response"),
        }

        Ok(response)
    }

    async fn read_cache(&self, key: &str) -> Option<TopKResponse> {
        match self.cache.get(key.to_string()).await {
            Ok(payload) => match serde_json::from_str(&payload) {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(key, error = %e, "discarding undecodable topk cache entry");
                    None
                }
            },
            Err(CustomRedisError::NotFound) => None,
            Err(e) => {
                warn!(key, error = %e, "topk cache unavailable, computing from counts");
                common_metrics::inc(CACHE_ERRORS, &[("op".to_string(), "read".to_string())], 1);
                None
            }
        }
    }

    async fn compute(&self, user_id: &str, days: u32, k: u32) -> Result<TopKResponse, ApiError> {
        let range = day_range(self.time.today(), days);
        let counts = self.counters.counts_for_days(user_id, &range).await?;

        Ok(TopKResponse {
            user_id: user_id.to_string(),
            days,
            k,
            results: rank_items(counts, k as usize),
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_redis::MockRedisClient;
    use topk_core::test_utils::MemoryCounterStore;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
    }

    fn yesterday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn engine(counters: MemoryCounterStore, cache: MockRedisClient) -> TopKEngine {
        TopKEngine::new(
            Arc::new(counters),
            Arc::new(cache),
            Arc::new(FixedTimeSource(today())),
            3600,
        )
    }

    fn item(item_id: &str, count: i64, rank: usize) -> RankedItem {
        RankedItem {
            item_id: item_id.to_string(),
            count,
            rank,
        }
    }

    #[test]
    fn day_range_ends_today() {
        assert_eq!(day_range(today(), 1), vec![today()]);
        assert_eq!(day_range(today(), 2), vec![today(), yesterday()]);
        // Crosses the month boundary
        assert_eq!(
            day_range(today(), 3)[2],
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }

    #[test]
    fn ties_break_on_item_id() {
        let counts = vec![
            DailyCount {
                day: today(),
                item_id: "b".to_string(),
                count: 2,
            },
            DailyCount {
                day: today(),
                item_id: "c".to_string(),
                count: 5,
            },
            // Same total as b, split over two days
            DailyCount {
                day: yesterday(),
                item_id: "a".to_string(),
                count: 1,
            },
            DailyCount {
                day: today(),
                item_id: "a".to_string(),
                count: 1,
            },
        ];
        assert_eq!(
            rank_items(counts.clone(), 10),
            vec![item("c", 5, 1), item("a", 2, 2), item("b", 2, 3)]
        );
        assert_eq!(rank_items(counts, 2), vec![item("c", 5, 1), item("a", 2, 2)]);
        assert!(rank_items(vec![], 10).is_empty());
    }

    #[tokio::test]
    async fn sums_over_the_requested_days_only() {
        let counters = MemoryCounterStore::new();
        counters.set("u1", today(), "a", 5);
        counters.set("u1", today(), "b", 3);
        counters.set("u1", yesterday(), "a", 2);
        // Outside a two day window
        counters.set("u1", NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(), "b", 100);
        // Someone else
        counters.set("u2", today(), "z", 50);

        let engine = engine(counters, MockRedisClient::new());
        let response = engine.top_k("u1", 2, 2).await.unwrap();

        assert_eq!(response.results, vec![item("a", 7, 1), item("b", 3, 2)]);
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn second_query_is_served_from_cache() {
        let counters = MemoryCounterStore::new();
        counters.set("u1", today(), "a", 1);
        let cache = MockRedisClient::new();
        let engine = engine(counters.clone(), cache.clone());

        let first = engine.top_k("u1", 7, 10).await.unwrap();
        // Counts move on, the cached answer does not until it expires
        counters.set("u1", today(), "a", 9);
        let second = engine.top_k("u1", 7, 10).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.results, second.results);

        let writes: Vec<_> = cache
            .get_calls()
            .into_iter()
            .filter(|call| call.op == "setex")
            .collect();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].key, "topk:u1:7:10");
        assert!(matches!(
            &writes[0].value,
            common_redis::MockRedisValue::StringWithTTL(_, 3600)
        ));
    }

    #[tokio::test]
    async fn cache_failures_fall_back_to_counts() {
        let counters = MemoryCounterStore::new();
        counters.set("u1", today(), "a", 4);
        let key = cache_key("u1", 7, 10);
        let cache = MockRedisClient::new()
            .get_ret(&key, Err(CustomRedisError::Timeout))
            .setex_ret(&key, Err(CustomRedisError::Timeout));
        let engine = engine(counters, cache);

        for _ in 0..2 {
            let response = engine.top_k("u1", 7, 10).await.unwrap();
            assert!(!response.cached);
            assert_eq!(response.results, vec![item("a", 4, 1)]);
        }
    }

    #[tokio::test]
    async fn undecodable_cache_entry_is_recomputed() {
        let counters = MemoryCounterStore::new();
        counters.set("u1", today(), "a", 4);
        let cache =
            MockRedisClient::new().get_ret(&cache_key("u1", 7, 10), Ok("not json".to_string()));

        let response = engine(counters, cache).top_k("u1", 7, 10).await.unwrap();
        assert!(!response.cached);
        assert_eq!(response.results, vec![item("a", 4, 1)]);
    }

    #[tokio::test]
    async fn counter_store_failure_is_an_error() {
        let counters = MemoryCounterStore::new();
        counters.fail_reads();

        let result = engine(counters, MockRedisClient::new()).top_k("u1", 7, 10).await;
        assert!(matches!(result, Err(ApiError::StoreError(_))));
    }
}
