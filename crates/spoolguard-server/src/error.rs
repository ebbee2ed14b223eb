use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use spoolguard_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Job already claimed by {0}")]
    AlreadyClaimed(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Upstream service unavailable: {0}")]
    Upstream(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable machine-readable code for API clients.
    fn code(&self) -> &'static str {
        match self {
            ServerError::JobNotFound(_) | ServerError::NotFound(_) => "not_found",
            ServerError::PermissionDenied(_) => "permission_denied",
            ServerError::AlreadyClaimed(_) => "already_claimed",
            ServerError::RateLimited => "rate_limited",
            ServerError::Unauthenticated => "unauthenticated",
            ServerError::Upstream(_) => "upstream_unavailable",
            ServerError::Validation(_) => "validation_error",
            ServerError::Store(_) | ServerError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ServerError::JobNotFound(_) | ServerError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::PermissionDenied(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::AlreadyClaimed(_) => (StatusCode::CONFLICT, self.to_string()),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            // Internal failures never echo their detail to clients.
            ServerError::Store(e) => {
                tracing::error!(error = %e, "store error surfaced to request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "internal error surfaced to request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": self.code(),
            "detail": detail,
        });

        (status, axum::Json(body)).into_response()
    }
}
