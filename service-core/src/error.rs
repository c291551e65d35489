use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Error returned to HTTP callers.
///
/// Client-facing variants carry a stable machine-readable kind (snake_case)
/// alongside the human message. Server-side variants never expose their
/// source in the response body; it is logged instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {1}")]
    BadRequest(&'static str, String),

    #[error("Unauthorized: {1}")]
    Unauthorized(&'static str, String),

    #[error("Forbidden: {1}")]
    Forbidden(&'static str, String),

    #[error("Conflict: {1}")]
    Conflict(&'static str, String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Bad Gateway: {1}")]
    BadGateway(&'static str, String),

    #[error("Service Unavailable")]
    ServiceUnavailable(Option<u64>),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Stable kind reported in the `error` field of the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "validation_error",
            AppError::BadRequest(kind, _)
            | AppError::Unauthorized(kind, _)
            | AppError::Forbidden(kind, _)
            | AppError::Conflict(kind, _)
            | AppError::BadGateway(kind, _) => *kind,
            AppError::TooManyRequests(_, _) => "rate_limited",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                "internal_error"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_, _) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_, _) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_, _) => StatusCode::FORBIDDEN,
            AppError::Conflict(_, _) => StatusCode::CONFLICT,
            AppError::TooManyRequests(_, _) => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_, _) => StatusCode::BAD_GATEWAY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_) | AppError::DatabaseError(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
            message: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let status = self.status();
        let kind = self.kind();

        let (message, details, retry_after) = match self {
            AppError::ValidationError(err) => (
                "Validation error".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::BadRequest(_, msg)
            | AppError::Unauthorized(_, msg)
            | AppError::Forbidden(_, msg)
            | AppError::Conflict(_, msg)
            | AppError::BadGateway(_, msg) => (msg, None, None),
            AppError::TooManyRequests(msg, retry) => (msg, None, retry),
            AppError::ServiceUnavailable(retry) => (
                "Service temporarily unavailable, please retry".to_string(),
                None,
                retry,
            ),
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal server error");
                ("Internal server error".to_string(), None, None)
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                ("Internal server error".to_string(), None, None)
            }
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                ("Internal server error".to_string(), None, None)
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: kind,
                message,
                details,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_hides_source() {
        let err = AppError::InternalError(anyhow::anyhow!("connection refused at 10.0.0.4:5432"));
        assert_eq!(err.kind(), "internal_error");
        let res = err.into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let res = AppError::TooManyRequests("slow down".to_string(), Some(42)).into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            res.headers()
                .get(axum::http::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("42")
        );
    }

    #[test]
    fn test_kind_passthrough() {
        let err = AppError::Unauthorized("token_revoked", "Token has been revoked".to_string());
        assert_eq!(err.kind(), "token_revoked");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
