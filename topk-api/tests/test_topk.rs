use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Days;
use common_redis::{CustomRedisError, MockRedisClient};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use topk_core::test_utils::MemoryCounterStore;
use tower::ServiceExt;

use crate::common::{test_router, today};

mod common;

async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let cache = response
        .headers()
        .get("x-cache")
        .map(|v| v.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, cache, serde_json::from_slice(&body).unwrap())
}

fn scenario_counts() -> MemoryCounterStore {
    let counters = MemoryCounterStore::new();
    let yesterday = today().checked_sub_days(Days::new(1)).unwrap();
    counters.set("u1", today(), "a", 5);
    counters.set("u1", today(), "b", 3);
    counters.set("u1", yesterday, "a", 2);
    counters
}

#[tokio::test]
async fn sums_days_and_ranks() {
    let app = test_router(Arc::new(scenario_counts()), MockRedisClient::new());

    let (status, cache, body) = get(app, "/users/u1/topk?days=2&k=2").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("MISS"));
    assert_eq!(
        body,
        json!({
            "user_id": "u1",
            "days": 2,
            "k": 2,
            "results": [
                {"item_id": "a", "count": 7, "rank": 1},
                {"item_id": "b", "count": 3, "rank": 2}
            ],
            "cached": false
        })
    );
}

#[tokio::test]
async fn equal_counts_rank_by_item_id_every_time() {
    let counters = MemoryCounterStore::new();
    counters.set("u1", today(), "zebra", 4);
    counters.set("u1", today(), "apple", 4);
    counters.set("u1", today(), "mango", 4);
    let counters = Arc::new(counters);

    for _ in 0..3 {
        // A fresh cache each time, so every answer is computed
        let app = test_router(counters.clone(), MockRedisClient::new());
        let (_, _, body) = get(app, "/users/u1/topk?k=2").await;
        assert_eq!(
            body["results"],
            json!([
                {"item_id": "apple", "count": 4, "rank": 1},
                {"item_id": "mango", "count": 4, "rank": 2}
            ])
        );
    }
}

#[tokio::test]
async fn second_call_is_a_cache_hit() {
    let cache = MockRedisClient::new();
    let app = test_router(Arc::new(scenario_counts()), cache.clone());

    let (_, first_cache, first) = get(app.clone(), "/users/u1/topk?days=2&k=2").await;
    let (_, second_cache, second) = get(app, "/users/u1/topk?days=2&k=2").await;

    assert_eq!(first_cache.as_deref(), Some("MISS"));
    assert_eq!(first["cached"], json!(false));
    assert_eq!(second_cache.as_deref(), Some("HIT"));
    assert_eq!(second["cached"], json!(true));
    assert_eq!(first["results"], second["results"]);

    // Each (user, days, k) has its own entry
    let keys: Vec<String> = cache
        .get_calls()
        .into_iter()
        .filter(|call| call.op == "setex")
        .map(|call| call.key)
        .collect();
    assert_eq!(keys, vec!["topk:u1:2:2".to_string()]);
}

#[tokio::test]
async fn defaults_apply_when_params_are_missing() {
    let app = test_router(Arc::new(scenario_counts()), MockRedisClient::new());

    let (status, _, body) = get(app, "/users/u1/topk").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["days"], json!(7));
    assert_eq!(body["k"], json!(10));
}

#[tokio::test]
async fn unknown_user_has_empty_results() {
    let app = test_router(Arc::new(scenario_counts()), MockRedisClient::new());

    let (status, _, body) = get(app, "/users/nobody/topk").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"], json!([]));
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let counters = scenario_counts();
    for uri in [
        "/users/u1/topk?days=0",
        "/users/u1/topk?days=31",
        "/users/u1/topk?k=0",
        "/users/u1/topk?k=101",
        "/users/u1/topk?k=ten",
        "/users/u1/topk?days=",
        "/users/bad%20id/topk",
        "/users/bad%2Fid/topk",
        "/users//topk",
        "/users//topk?days=2&k=2",
    ] {
        let app = test_router(Arc::new(counters.clone()), MockRedisClient::new());
        let (status, cache, body) = get(app, uri).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(cache, None, "{uri}");
        assert!(body["error"].as_str().unwrap().starts_with("invalid"), "{uri}");
    }
}

#[tokio::test]
async fn empty_user_id_is_a_bad_request() {
    let app = test_router(Arc::new(scenario_counts()), MockRedisClient::new());

    let (status, _, body) = get(app, "/users//topk").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"error": "invalid user_id: expected 1 to 128 characters from [A-Za-z0-9._:@-]"})
    );
}

#[tokio::test]
async fn cache_outage_does_not_fail_queries() {
    let cache = MockRedisClient::new()
        .get_ret("topk:u1:2:2", Err(CustomRedisError::Timeout))
        .setex_ret("topk:u1:2:2", Err(CustomRedisError::Timeout));
    let app = test_router(Arc::new(scenario_counts()), cache);

    let (status, cache, body) = get(app, "/users/u1/topk?days=2&k=2").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("MISS"));
    assert_eq!(body["results"][0], json!({"item_id": "a", "count": 7, "rank": 1}));
}

#[tokio::test]
async fn counter_store_failure_is_a_500() {
    let counters = scenario_counts();
    counters.fail_reads();
    let app = test_router(Arc::new(counters), MockRedisClient::new());

    let (status, _, body) = get(app, "/users/u1/topk").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    // No partial results, and no internals
    assert_eq!(body.get("results"), None);
    assert!(!body["error"].as_str().unwrap().contains("SELECT"));
}
