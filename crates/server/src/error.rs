use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Request-level failures. Each maps to one status code and a message that is
/// safe to show the caller; internal detail only goes to the log.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A required secret or collaborator is missing from config.
    #[error("not configured: {0}")]
    Configuration(&'static str),

    /// Request failed signature verification.
    #[error("authentication failed: {0}")]
    Authentication(&'static str),

    /// Bearer token missing or wrong.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed input. The message is user facing.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("downstream failure: {0}")]
    Downstream(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Authentication(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Downstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn public_message(&self) -> String {
        match self {
            Self::Configuration(what) => (*what).to_string(),
            Self::Authentication(what) => (*what).to_string(),
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::Validation(msg) => msg.clone(),
            Self::RateLimited { retry_after_secs } => format!(
                "送信回数の上限に達しました。{}秒後に再度お試しください。",
                retry_after_secs
            ),
            Self::Downstream(_) => {
                "サーバーエラーが発生しました。時間をおいて再度お試しください。".to_string()
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.public_message();

        match self {
            Self::Downstream(err) => {
                error!(error = ?err, "Request failed on a downstream call");
                (status, Json(json!({ "error": message }))).into_response()
            }
            Self::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(json!({ "error": message, "retryAfter": retry_after_secs })),
            )
                .into_response(),
            _ => (status, Json(json!({ "error": message }))).into_response(),
        }
    }
}
