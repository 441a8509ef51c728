//! Crate-wide error taxonomy and its HTTP representation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// One entry per error kind. Each variant carries enough context to
/// render the `{error:{message,type,code?}}` body and pick a status code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("api_key_missing")]
    ApiKeyMissing,
    #[error("invalid_api_key")]
    InvalidApiKey,
    #[error("api_key_expired")]
    ApiKeyExpired,
    #[error("api_key_rotation_required")]
    ApiKeyRotationRequired,
    #[error("insufficient_permissions")]
    InsufficientPermissions,

    #[error("model_not_available")]
    ModelNotAvailable(String),

    #[error("daily_limit_exceeded")]
    DailyLimitExceeded { limit: u64, used: u64 },

    #[error("rate_limit_exceeded: {0}")]
    RateLimit(String),

    #[error("provider_denial")]
    ProviderDenial,

    #[error("upstream_network: {0}")]
    UpstreamNetwork(String),

    #[error("upstream error ({status}): {body}")]
    Upstream5xx { status: u16, body: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("all upstream providers failed: {details}")]
    AllProvidersFailed {
        details: String,
        last_provider_error_body: Option<serde_json::Value>,
    },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "invalid_request_error",
            AppError::ApiKeyMissing
            | AppError::InvalidApiKey
            | AppError::ApiKeyExpired
            | AppError::ApiKeyRotationRequired => "authentication_error",
            AppError::InsufficientPermissions => "forbidden_error",
            AppError::ModelNotAvailable(_) => "forbidden_error",
            AppError::DailyLimitExceeded { .. } => "tokens",
            AppError::RateLimit(_) => "rate_limit_error",
            AppError::ProviderDenial => "forbidden_error",
            AppError::UpstreamNetwork(_) => "server_error",
            AppError::Upstream5xx { .. } => "server_error",
            AppError::Configuration(_) => "server_error",
            AppError::AllProvidersFailed { .. } => "server_error",
            AppError::Internal(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ApiKeyMissing => StatusCode::UNAUTHORIZED,
            AppError::ApiKeyExpired => StatusCode::UNAUTHORIZED,
            AppError::InvalidApiKey => StatusCode::FORBIDDEN,
            AppError::ApiKeyRotationRequired => StatusCode::FORBIDDEN,
            AppError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AppError::ModelNotAvailable(_) => StatusCode::FORBIDDEN,
            AppError::DailyLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::ProviderDenial => StatusCode::BAD_GATEWAY,
            AppError::UpstreamNetwork(_) => StatusCode::BAD_GATEWAY,
            AppError::Upstream5xx { .. } => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::DailyLimitExceeded { limit, used } => {
                format!("daily token limit exceeded ({used}/{limit})")
            }
            AppError::AllProvidersFailed { details, .. } => {
                format!("All upstream providers failed: {details}")
            }
            AppError::ModelNotAvailable(model) => format!("model not available on your plan: {model}"),
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let status = self.status();
        let error_type = self.error_type();
        let message = self.message();
        let mut body = json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        });
        if let AppError::AllProvidersFailed {
            details,
            last_provider_error_body,
        } = &self
        {
            body["error"]["details"] = json!(details);
            if let Some(b) = last_provider_error_body {
                body["error"]["last_provider_error_body"] = b.clone();
            }
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
