use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Validation error: {}", .0.join("; "))]
    SchemaViolations(Vec<String>),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Insufficient permissions: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl AppError {
    /// Stable error code used in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) | AppError::SchemaViolations(_) => "invalid_schema",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "insufficient_permissions",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::RateLimited => "rate_limited",
            AppError::PayloadTooLarge(_) => "payload_too_large",
            AppError::Timeout(_) => "timeout",
            AppError::Internal(_) | AppError::Database(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::SchemaViolations(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Optional structured details for the envelope.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::SchemaViolations(violations) => Some(json!({ "violations": violations })),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code, message, "request failed");
        }

        let mut error = json!({
            "code": code,
            "message": message,
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }

        (status, axum::Json(json!({ "error": error }))).into_response()
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => AppError::NotFound("Record not found".to_string()),
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AppError::Validation("x".into()).code(), "invalid_schema");
        assert_eq!(AppError::NotFound("x".into()).code(), "not_found");
        assert_eq!(AppError::Conflict("x".into()).code(), "conflict");
        assert_eq!(AppError::Timeout("x".into()).code(), "timeout");
        assert_eq!(AppError::Database("x".into()).code(), "internal_error");
    }

    #[test]
    fn schema_violations_join_in_message() {
        let err = AppError::SchemaViolations(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Validation error: a; b");
    }
}
