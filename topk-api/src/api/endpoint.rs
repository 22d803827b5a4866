use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json, Response};

use crate::api::errors::ApiError;
use crate::api::types::{validate_user_id, TopKParams};
use crate::metrics_consts::{TOPK_REJECTED, TOPK_REQUESTS};
use crate::router;

pub const CACHE_HEADER: &str = "x-cache";

/// `GET /users/:user_id/topk?days=N&k=K`
pub async fn topk(
    State(state): State<router::State>,
    Path(user_id): Path<String>,
    Query(params): Query<TopKParams>,
) -> Result<Response, ApiError> {
    common_metrics::inc(TOPK_REQUESTS, &[], 1);

    let validated = validate_user_id(&user_id).and_then(|_| state.bounds.resolve(&params));
    let (days, k) = match validated {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::debug!(user_id, error = %e, "rejecting topk request");
            common_metrics::inc(TOPK_REJECTED, &[], 1);
            return Err(e);
        }
    };

    let response = state.engine.top_k(&user_id, days, k).await?;
    let cache_status = if response.cached { "HIT" } else { "MISS" };

    Ok(([(CACHE_HEADER, cache_status)], Json(response)).into_response())
}

/// `GET /users//topk`: an empty segment never matches `:user_id`.
pub async fn topk_without_user() -> ApiError {
    common_metrics::inc(TOPK_REQUESTS, &[], 1);
    common_metrics::inc(TOPK_REJECTED, &[], 1);
    ApiError::InvalidUserId
}
