use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use topk_core::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("invalid user_id: expected 1 to 128 characters from [A-Za-z0-9._:@-]")]
    InvalidUserId,
    #[error("failed to read counts: {0}")]
    StoreError(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidParameter { .. } | ApiError::InvalidUserId => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ApiError::StoreError(e) => {
                tracing::error!("Internal server error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred. Please try again later.".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
