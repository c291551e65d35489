use service_core::error::AppError;
use thiserror::Error;

use super::jwt::TokenError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    /// The cache could not be reached and the operation cannot proceed without it.
    #[error("Backing store unavailable")]
    StoreUnavailable,

    #[error("{0}")]
    Token(#[from] TokenError),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token has been revoked")]
    TokenRevoked,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected,

    #[error("Wrong token type for this operation")]
    InvalidTokenType,

    #[error("Missing bearer token")]
    MissingAuthorization,

    #[error("Multi-factor authentication required")]
    MfaRequired,

    #[error("Invalid verification code")]
    MfaInvalidCode,

    #[error("Multi-factor authentication is not enrolled")]
    MfaNotEnrolled,

    #[error("Multi-factor authentication is already enabled")]
    MfaAlreadyEnabled,

    #[error("Too many attempts")]
    RateLimited { retry_after: u64 },

    #[error("OAuth state is invalid or expired")]
    OAuthStateInvalid,

    #[error("OAuth provider error: {0}")]
    OAuthProviderError(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Redirect target is not allowed")]
    InvalidRedirect,

    #[error("Reset token is invalid or expired")]
    InvalidResetToken,

    #[error("Cannot remove the last sign-in method")]
    LastAuthMethod,

    #[error("A phone number is required for SMS delivery")]
    PhoneRequired,

    #[error("Email address already registered")]
    EmailTaken,
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::StoreUnavailable => AppError::ServiceUnavailable(Some(1)),
            ServiceError::Token(e) => AppError::Unauthorized(e.kind(), e.to_string()),
            ServiceError::InvalidCredentials => {
                AppError::Unauthorized("invalid_credentials", "Invalid email or password".to_string())
            }
            ServiceError::TokenRevoked => {
                AppError::Unauthorized("token_revoked", "Token has been revoked".to_string())
            }
            ServiceError::TokenReuseDetected => AppError::Unauthorized(
                "token_reuse_detected",
                "Refresh token reuse detected; all sessions have been revoked".to_string(),
            ),
            ServiceError::InvalidTokenType => AppError::Unauthorized(
                "invalid_token_type",
                "Token type is not valid for this operation".to_string(),
            ),
            ServiceError::MissingAuthorization => AppError::Unauthorized(
                "missing_authorization",
                "Missing or malformed Authorization header".to_string(),
            ),
            ServiceError::MfaRequired => AppError::Unauthorized(
                "mfa_required",
                "Multi-factor authentication required".to_string(),
            ),
            ServiceError::MfaInvalidCode => {
                AppError::Unauthorized("mfa_invalid_code", "Invalid verification code".to_string())
            }
            ServiceError::MfaNotEnrolled => AppError::BadRequest(
                "mfa_not_enrolled",
                "Multi-factor authentication is not enrolled".to_string(),
            ),
            ServiceError::MfaAlreadyEnabled => AppError::Conflict(
                "mfa_already_enabled",
                "Multi-factor authentication is already enabled".to_string(),
            ),
            ServiceError::RateLimited { retry_after } => AppError::TooManyRequests(
                "Too many attempts, please retry later".to_string(),
                Some(retry_after),
            ),
            ServiceError::OAuthStateInvalid => AppError::BadRequest(
                "oauth_state_invalid",
                "OAuth state is invalid or expired".to_string(),
            ),
            ServiceError::OAuthProviderError(msg) => {
                tracing::warn!(error = %msg, "OAuth provider error");
                AppError::BadGateway(
                    "oauth_provider_error",
                    "The identity provider rejected the request".to_string(),
                )
            }
            ServiceError::UnsupportedProvider(name) => AppError::BadRequest(
                "unsupported_provider",
                format!("Provider '{}' is not supported", name),
            ),
            ServiceError::InvalidRedirect => AppError::BadRequest(
                "invalid_redirect",
                "Redirect target is not allowed".to_string(),
            ),
            ServiceError::InvalidResetToken => AppError::BadRequest(
                "invalid_reset_token",
                "Reset token is invalid or expired".to_string(),
            ),
            ServiceError::LastAuthMethod => AppError::Conflict(
                "last_auth_method",
                "Cannot remove the last sign-in method".to_string(),
            ),
            ServiceError::PhoneRequired => AppError::BadRequest(
                "phone_required",
                "A phone number is required for SMS delivery".to_string(),
            ),
            ServiceError::EmailTaken => AppError::Conflict(
                "email_taken",
                "Email address already registered".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_kinds_and_statuses() {
        let cases: Vec<(ServiceError, &str, StatusCode)> = vec![
            (ServiceError::InvalidCredentials, "invalid_credentials", StatusCode::UNAUTHORIZED),
            (ServiceError::Token(TokenError::Expired), "token_expired", StatusCode::UNAUTHORIZED),
            (
                ServiceError::Token(TokenError::InvalidAlgorithm),
                "invalid_algorithm",
                StatusCode::UNAUTHORIZED,
            ),
            (ServiceError::MfaNotEnrolled, "mfa_not_enrolled", StatusCode::BAD_REQUEST),
            (ServiceError::MfaAlreadyEnabled, "mfa_already_enabled", StatusCode::CONFLICT),
            (
                ServiceError::RateLimited { retry_after: 5 },
                "rate_limited",
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ServiceError::OAuthProviderError("boom".to_string()),
                "oauth_provider_error",
                StatusCode::BAD_GATEWAY,
            ),
            (ServiceError::LastAuthMethod, "last_auth_method", StatusCode::CONFLICT),
            (ServiceError::EmailTaken, "email_taken", StatusCode::CONFLICT),
            (
                ServiceError::StoreUnavailable,
                "service_unavailable",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, kind, status) in cases {
            let app: AppError = err.into();
            assert_eq!(app.kind(), kind);
            assert_eq!(app.status(), status);
        }
    }

    #[test]
    fn test_provider_error_detail_is_not_exposed() {
        let app: AppError = ServiceError::OAuthProviderError("client_secret=abc".to_string()).into();
        assert!(!app.to_string().contains("client_secret"));
    }
}
