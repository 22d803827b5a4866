use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use common_kafka::kafka_producer::create_kafka_producer;
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::{HealthHandle, HealthRegistry};
use topk_core::{PgCounterStore, ScheduleStore};
use topk_scheduler::{config::Config, scheduler::Scheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn poll_loop(scheduler: Arc<Scheduler>, liveness: HealthHandle, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        // A failed poll is retried on the next tick, the loop itself is alive
        if let Err(e) = scheduler.poll().await {
            error!("scheduler poll failed with: {}", e);
        }
        liveness.report_healthy().await;
    }
}

async fn reconcile_loop(scheduler: Arc<Scheduler>, liveness: HealthHandle, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        if let Err(e) = scheduler.reconcile().await {
            error!("scheduler reconcile failed with: {}", e);
        }
        liveness.report_healthy().await;
    }
}

async fn retention_loop(scheduler: Arc<Scheduler>, liveness: HealthHandle, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        if let Err(e) = scheduler.enforce_retention().await {
            error!("counter retention failed with: {}", e);
        }
        liveness.report_healthy().await;
    }
}

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "topk scheduler"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    config.validate().wrap_err("invalid configuration")?;
    let liveness = HealthRegistry::new("liveness");

    let store = ScheduleStore::new(config.pool_config())
        .await
        .wrap_err("failed to connect to postgres")?;
    if config.run_migrations {
        store.run_migrations().await.wrap_err("failed to run migrations")?;
    }

    let kafka_liveness = liveness
        .register("rdkafka".to_string(), Duration::from_secs(30))
        .await;
    let kafka_producer = create_kafka_producer(&config.kafka, kafka_liveness)
        .await
        .wrap_err("failed to create kafka producer")?;

    let scheduler = Arc::new(Scheduler {
        counters: PgCounterStore::from_pool(store.pool().clone()),
        store,
        kafka_producer,
        settings: config.scheduler_settings(),
        metrics_labels: vec![],
    });

    // Each loop must check in at least once every four of its intervals
    let poll_liveness = liveness
        .register(
            "poll_loop".to_string(),
            Duration::from_secs(config.scheduler_poll_interval_secs * 4),
        )
        .await;
    let reconcile_liveness = liveness
        .register(
            "reconcile_loop".to_string(),
            Duration::from_secs(config.scheduler_reconcile_interval_secs * 4),
        )
        .await;
    let retention_liveness = liveness
        .register(
            "retention_loop".to_string(),
            Duration::from_secs(config.retention_interval_secs * 4),
        )
        .await;

    let poll = tokio::spawn(poll_loop(
        scheduler.clone(),
        poll_liveness,
        config.scheduler_poll_interval_secs,
    ));
    let reconcile = tokio::spawn(reconcile_loop(
        scheduler.clone(),
        reconcile_liveness,
        config.scheduler_reconcile_interval_secs,
    ));
    let retention = tokio::spawn(retention_loop(
        scheduler,
        retention_liveness,
        config.retention_interval_secs,
    ));

    let app = setup_metrics_routes(app(liveness));
    let bind = format!("{}:{}", config.host, config.port);
    info!("starting scheduler, listening on {}", bind);
    let http_server = tokio::spawn(async move { serve(app, &bind).await });

    tokio::select! {
        _ = poll => error!("poll loop exited"),
        _ = reconcile => error!("reconcile loop exited"),
        _ = retention => error!("retention loop exited"),
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
