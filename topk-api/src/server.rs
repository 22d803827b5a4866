use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_redis::RedisClient;
use health::{HealthHandle, HealthRegistry};
use tokio::net::TcpListener;
use topk_core::PgCounterStore;

use crate::config::Config;
use crate::router;
use crate::topk::{SystemTimeSource, TopKEngine};

/// Connects to the counter store and the cache, then serves the API on
/// `listener` until `shutdown` resolves.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let counters = match PgCounterStore::new(config.pool_config()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to create counter store: {}", e);
            return;
        }
    };

    // An unreachable cache at startup is fatal, a cache that later goes away is not
    let redis_client = match RedisClient::with_config(
        config.redis_url.clone(),
        Some(Duration::from_millis(config.redis_response_timeout_ms)),
        Some(Duration::from_millis(config.redis_connection_timeout_ms)),
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(
                "Failed to create Redis client for URL {}: {}",
                config.redis_url,
                e
            );
            return;
        }
    };

    let engine = Arc::new(TopKEngine::new(
        counters,
        redis_client,
        Arc::new(SystemTimeSource),
        config.cache_ttl_seconds,
    ));

    let health = HealthRegistry::new("liveness");
    let simple_loop = health
        .register("simple_loop".to_string(), Duration::from_secs(30))
        .await;
    tokio::spawn(liveness_loop(simple_loop));

    let app = router::router(engine, health, &config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on an unknown address: {}", e),
    }
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("server failed: {}", e);
    }
}

async fn liveness_loop(handle: HealthHandle) {
    loop {
        handle.report_healthy().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}
