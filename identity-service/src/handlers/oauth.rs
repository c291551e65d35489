//! OAuth login, callback and link management.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::{
    axum::{
        extract::{Path, Query, State},
        http::StatusCode,
        response::{IntoResponse, Redirect, Response},
        Json,
    },
    error::AppError,
};

use crate::{
    dtos::oauth::{OAuthCallbackQuery, OAuthLoginQuery, ProvidersResponse},
    middleware::AuthUser,
    services::{IssuedToken, ServiceError},
    AppState,
};

fn session_cookie(name: &'static str, token: &IssuedToken, secure: bool) -> Cookie<'static> {
    Cookie::build((name, token.token.clone()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::seconds(token.claims.remaining_seconds()))
        .build()
}

/// Start an OAuth login
#[utoipa::path(
    get,
    path = "/oauth/{provider}/login",
    params(
        ("provider" = String, Path, description = "google or github"),
        OAuthLoginQuery
    ),
    responses(
        (status = 303, description = "Redirect to the provider"),
        (status = 400, description = "Unsupported provider or redirect target", body = ErrorResponse),
        (status = 503, description = "Cache unavailable", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip(state, query))]
pub async fn oauth_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthLoginQuery>,
) -> Result<Redirect, AppError> {
    let url = state
        .oauth
        .initiate(&provider, query.redirect_uri.as_deref())
        .await?;
    Ok(Redirect::to(&url))
}

/// Provider callback: sets session cookies and redirects to the stored target
#[utoipa::path(
    get,
    path = "/oauth/{provider}/callback",
    params(
        ("provider" = String, Path, description = "google or github"),
        OAuthCallbackQuery
    ),
    responses(
        (status = 303, description = "Logged in; redirect with session cookies"),
        (status = 400, description = "Invalid or reused state", body = ErrorResponse),
        (status = 502, description = "Provider error", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip(state, jar, query))]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<(CookieJar, Response), AppError> {
    let oauth_state = query.state.ok_or(ServiceError::OAuthStateInvalid)?;
    let code = match (query.code, query.error) {
        (Some(code), _) => code,
        (None, error) => {
            return Err(ServiceError::OAuthProviderError(format!(
                "callback without code: {}",
                error.unwrap_or_else(|| "no error given".to_string())
            ))
            .into())
        }
    };

    let login = state.oauth.callback(&provider, &oauth_state, &code).await?;

    let secure = state.config.security.secure_cookies;
    let jar = jar
        .add(session_cookie("access_token", &login.tokens.access, secure))
        .add(session_cookie("refresh_token", &login.tokens.refresh, secure));

    Ok((jar, Redirect::to(&login.redirect_uri).into_response()))
}

/// Configured providers and which of them are linked
#[utoipa::path(
    get,
    path = "/oauth/providers",
    responses(
        (status = 200, description = "Provider list", body = ProvidersResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn list_providers(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<ProvidersResponse>, AppError> {
    let providers = state.oauth.providers(claims.sub).await?;
    Ok(Json(ProvidersResponse { providers }))
}

/// Remove a provider link
#[utoipa::path(
    delete,
    path = "/oauth/{provider}",
    params(("provider" = String, Path, description = "google or github")),
    responses(
        (status = 204, description = "Link removed"),
        (status = 409, description = "Last remaining sign-in method", body = ErrorResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state, claims), fields(user_id = %claims.sub))]
pub async fn unlink_provider(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(provider): Path<String>,
) -> Result<StatusCode, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    state.oauth.unlink(&identity, &provider).await?;
    Ok(StatusCode::NO_CONTENT)
}
