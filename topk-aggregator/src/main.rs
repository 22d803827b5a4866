//! Consume listening events, deduplicate them and persist daily item counts.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::{routing::get, Router};
use common_kafka::config::ConsumerConfig;
use common_kafka::EVENTS_TOPIC;
use common_metrics::{serve, setup_metrics_routes};
use common_redis::RedisClient;
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use topk_aggregator::aggregator::Aggregator;
use topk_aggregator::config::Config;
use topk_aggregator::consumer::{create_consumer, AggregatorConsumer};
use topk_core::{PgCounterStore, RedisDedupStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "topk aggregator"
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl+c: {}", e);
            }
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    ConsumerConfig::set_defaults("aggregator", EVENTS_TOPIC, false);
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {e}"))?;
    let liveness = HealthRegistry::new("liveness");

    let counters = PgCounterStore::new(config.pool_config())
        .await
        .context("failed to connect to postgres")?;

    let redis = RedisClient::with_config(
        config.redis_url.clone(),
        Some(Duration::from_millis(config.redis_response_timeout_ms)),
        Some(Duration::from_millis(config.redis_connection_timeout_ms)),
    )
    .await
    .context("failed to connect to redis")?;
    let dedup = RedisDedupStore::new(Arc::new(redis), config.dedup_config());

    let aggregator = Aggregator::new(dedup, counters, config.aggregator_settings());

    let kafka_liveness = liveness
        .register("rdkafka".to_string(), Duration::from_secs(30))
        .await;
    let consumer = create_consumer(&config.kafka, &config.consumer, kafka_liveness)
        .context("failed to create kafka consumer")?;

    let loop_liveness = liveness
        .register("aggregator".to_string(), config.loop_liveness_deadline())
        .await;
    let mut aggregator_consumer = AggregatorConsumer::new(
        consumer,
        &config.consumer.kafka_consumer_topic,
        aggregator,
        Duration::from_secs(config.flush_interval_secs),
        loop_liveness,
    );

    let app = setup_metrics_routes(app(liveness));
    let bind = config.bind();
    info!("starting aggregator, listening on {}", bind);
    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    let outcome = aggregator_consumer.run(shutdown_signal()).await;

    http_server.abort();
    outcome.context("aggregator stopped")?;
    info!("exiting");
    Ok(())
}
