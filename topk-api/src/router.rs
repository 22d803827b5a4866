use std::future::ready;
use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use common_metrics::{setup_metrics_recorder, track_metrics};
use health::HealthRegistry;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::endpoint;
use crate::api::types::QueryBounds;
use crate::config::Config;
use crate::topk::TopKEngine;

#[derive(Clone)]
pub struct State {
    pub engine: Arc<TopKEngine>,
    pub bounds: QueryBounds,
}

pub fn router(engine: Arc<TopKEngine>, liveness: HealthRegistry, config: &Config) -> Router {
    let state = State {
        engine,
        bounds: config.query_bounds(),
    };

    // Read-only endpoint, any origin may call it
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS, Method::HEAD])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_origin(AllowOrigin::mirror_request());

    let status_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    let topk_router = Router::new()
        .route("/users/:user_id/topk", get(endpoint::topk))
        .route("/users//topk", get(endpoint::topk_without_user))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    let router = Router::new()
        .merge(status_router)
        .merge(topk_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The global recorder can only be installed once per process, keep it
    // out of tests
    if config.enable_metrics {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router.route("/metrics", get(move || ready(recorder_handle.render())))
            }
            Err(e) => {
                tracing::warn!("metrics recorder not installed: {}", e);
                router
            }
        }
    } else {
        router
    }
}

pub async fn index() -> &'static str {
    "topk api"
}
