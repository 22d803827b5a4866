//! Consume crawl jobs, fetch provider events and publish them to the events topic.
use std::future::ready;
use std::time::Duration;

use axum::{routing::get, Router};
use common_kafka::config::ConsumerConfig;
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::create_kafka_producer;
use common_kafka::CRAWL_JOBS_TOPIC;
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::HealthRegistry;
use topk_core::ScheduleStore;
use topk_worker::config::Config;
use topk_worker::provider::HttpProviderAdapter;
use topk_worker::worker::{CrawlProcessor, Worker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "topk worker"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    ConsumerConfig::set_defaults("topk-worker", CRAWL_JOBS_TOPIC, true);
    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let liveness = HealthRegistry::new("liveness");

    let store = ScheduleStore::new(config.pool_config())
        .await
        .wrap_err("failed to connect to postgres")?;

    let kafka_liveness = liveness
        .register("rdkafka".to_string(), Duration::from_secs(30))
        .await;
    let producer = create_kafka_producer(&config.kafka, kafka_liveness)
        .await
        .wrap_err("failed to create kafka producer")?;
    let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())
        .wrap_err("failed to create kafka consumer")?;

    let provider = HttpProviderAdapter::new(
        &config.provider_adapter_url,
        config.provider_request_timeout.0,
    )
    .wrap_err("failed to create provider adapter client")?;

    let processor = CrawlProcessor::new(
        store,
        provider,
        producer,
        &config.events_topic,
        chrono::Duration::hours(config.crawl_period_hours),
        config.retry_policy(),
    );

    let worker_liveness = liveness
        .register("worker".to_string(), Duration::from_secs(60))
        .await;
    let worker = Worker::new(
        consumer,
        processor,
        config.worker_max_concurrent_jobs,
        worker_liveness,
    );

    let app = setup_metrics_routes(app(liveness));
    let bind = config.bind();
    info!("starting worker, listening on {}", bind);
    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    tokio::select! {
        _ = worker.run() => error!("worker loop exited"),
        res = http_server => {
            error!("http server exited");
            if let Ok(Err(e)) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
    Ok(())
}
