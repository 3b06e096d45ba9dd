use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("resolution error: {0}")]
    Resolution(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::SubscriptionNotFound => {
                // Routine: bad links and revoked tokens hit this constantly.
                tracing::warn!("subscription not found");
                (
                    StatusCode::NOT_FOUND,
                    "not_found_error",
                    "subscription_not_found",
                    "subscription not found or has no active keys".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Resolution(e) => {
                tracing::error!("Resolution error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
