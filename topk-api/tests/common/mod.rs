use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use chrono::NaiveDate;
use common_redis::MockRedisClient;
use health::HealthRegistry;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use topk_api::config::Config;
use topk_api::router::router;
use topk_api::topk::{FixedTimeSource, TopKEngine};
use topk_core::CounterStore;

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
}

pub fn test_router(counters: Arc<dyn CounterStore>, cache: MockRedisClient) -> Router {
    let config = Config::default_test_config();
    let engine = Arc::new(TopKEngine::new(
        counters,
        Arc::new(cache),
        Arc::new(FixedTimeSource(today())),
        config.cache_ttl_seconds,
    ));
    router(engine, HealthRegistry::new("liveness"), &config)
}

/// A router served on an ephemeral local port, stopped on drop.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn for_router(app: Router) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { notify.notified().await })
                .await
                .unwrap()
        });
        ServerHandle { addr, shutdown }
    }

    pub async fn get_topk(&self, user_id: &str, query: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{:?}/users/{user_id}/topk{query}", self.addr))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
