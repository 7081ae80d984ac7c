//! HTTP error responses.

use crate::error::{ConfigError, CronError, GatewayError};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::warn;

/// Error returned by HTTP and RPC handlers.
///
/// Renders as `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// Create an error.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// 400 `invalid_request`.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    /// 401 `unauthorized`.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    /// 403 `blocked`.
    pub fn blocked(tool: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, "blocked", format!("tool '{tool}' is not allowed"))
    }

    /// 404 `not_found`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// The `{code, message}` object.
    #[must_use]
    pub fn body(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let message = err.to_string();
        let (status, code) = match &err {
            GatewayError::Validation(_)
            | GatewayError::Json(_)
            | GatewayError::Cron(CronError::InvalidSchedule { .. }) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            GatewayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::Blocked(_) => (StatusCode::FORBIDDEN, "blocked"),
            GatewayError::NotFound(_) | GatewayError::Cron(CronError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            GatewayError::Cron(CronError::AlreadyExists(_)) => (StatusCode::CONFLICT, "conflict"),
            GatewayError::Backend(_) | GatewayError::Channel(_) => {
                warn!(error = %message, "dependency failure");
                (StatusCode::BAD_GATEWAY, "dependency_failed")
            }
            GatewayError::Config(ConfigError::Io(_)) => {
                warn!(error = %message, "config write failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error")
            }
            GatewayError::Config(_) => (StatusCode::CONFLICT, "config_error"),
            GatewayError::Storage(_)
            | GatewayError::Cron(CronError::Storage(_))
            | GatewayError::Io(_)
            | GatewayError::Task(_)
            | GatewayError::Internal(_) => {
                warn!(error = %message, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.body() }))).into_response()
    }
}

/// Handler result.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (GatewayError::invalid("x"), StatusCode::BAD_REQUEST, "invalid_request"),
            (GatewayError::not_found("x"), StatusCode::NOT_FOUND, "not_found"),
            (GatewayError::Blocked("x".into()), StatusCode::FORBIDDEN, "blocked"),
            (
                GatewayError::Config(ConfigError::NoConfigPath),
                StatusCode::CONFLICT,
                "config_error",
            ),
            (
                GatewayError::Cron(CronError::AlreadyExists("j".into())),
                StatusCode::CONFLICT,
                "conflict",
            ),
            (GatewayError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ];
        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn test_body_shape() {
        let err = ApiError::invalid("missing channelId");
        assert_eq!(err.body(), json!({"code": "invalid_request", "message": "missing channelId"}));
    }
}
