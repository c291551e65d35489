use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;

use crate::services::{Claims, ServiceError};
use crate::AppState;

/// Exact match, or a `/prefix/*` entry matching the prefix itself and
/// everything under it.
pub fn is_public_path(path: &str, public_paths: &[String]) -> bool {
    public_paths.iter().any(|entry| match entry.strip_suffix("/*") {
        Some(prefix) => path == prefix || path.starts_with(&format!("{}/", prefix)),
        None => path == entry,
    })
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Require a valid, non-revoked access token on every path outside the
/// allow-list. On public paths a bearer is optional; when it checks out
/// the claims are still attached so logout and rate limiting can use them.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let public = is_public_path(req.uri().path(), &state.config.security.public_paths);
    let token = bearer_token(req.headers()).map(str::to_string);

    match (token, public) {
        (Some(token), true) => {
            if let Ok(claims) = state.sessions.authenticate(&token).await {
                req.extensions_mut().insert(claims);
            }
        }
        (None, true) => {}
        (Some(token), false) => {
            let claims = state.sessions.authenticate(&token).await.map_err(|e| {
                tracing::debug!(error = %e, path = %req.uri().path(), "Bearer rejected");
                AppError::from(e)
            })?;
            req.extensions_mut().insert(claims);
        }
        (None, false) => return Err(ServiceError::MissingAuthorization.into()),
    }

    Ok(next.run(req).await)
}

/// Claims of the authenticated caller.
pub struct AuthUser(pub Claims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts
            .extensions
            .get::<Claims>()
            .ok_or(ServiceError::MissingAuthorization)?;

        Ok(AuthUser(claims.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Vec<String> {
        vec![
            "/health".to_string(),
            "/auth/login".to_string(),
            "/docs/*".to_string(),
        ]
    }

    #[test]
    fn test_exact_entries() {
        assert!(is_public_path("/health", &paths()));
        assert!(is_public_path("/auth/login", &paths()));
        assert!(!is_public_path("/auth/login/extra", &paths()));
        assert!(!is_public_path("/healthz", &paths()));
    }

    #[test]
    fn test_prefix_entries() {
        assert!(is_public_path("/docs", &paths()));
        assert!(is_public_path("/docs/index.html", &paths()));
        assert!(!is_public_path("/docsx", &paths()));
        assert!(!is_public_path("/auth/session", &paths()));
    }

    #[test]
    fn test_bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
