use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{
        LoginRequest, LoginResponse, LogoutRequest, RefreshRequest, RegisterRequest,
        RegisterResponse, TokenResponse,
    },
    middleware::AuthUser,
    services::{Claims, LoginOutcome},
    utils::{Password, ValidatedJson},
    AppState,
};

/// Register an email/password account in a new tenant
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = RegisterResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let password = Password::new(req.password);
    let (identity, tokens) = state.sessions.register(&req.email, &password).await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse::new(&identity, tokens))))
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token pair, or an MFA challenge when a second factor is owed", body = LoginResponse),
        (status = 401, description = "Invalid credentials or code", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
        (status = 503, description = "Cache unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let password = Password::new(req.password);
    let outcome = state
        .sessions
        .login(&req.email, &password, req.mfa_code.as_deref())
        .await?;

    let body = match outcome {
        LoginOutcome::Tokens(tokens) => LoginResponse::Tokens(tokens.into()),
        LoginOutcome::MfaRequired { temp_token } => LoginResponse::MfaRequired(temp_token.into()),
    };
    Ok((StatusCode::OK, Json(body)))
}

/// Rotate a refresh token
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = TokenResponse),
        (status = 401, description = "Invalid, expired or reused token", body = ErrorResponse),
        (status = 503, description = "Cache unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tokens = state.sessions.refresh(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(TokenResponse::from(tokens))))
}

/// Revoke the refresh token and, when a bearer is sent, the access token
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Logged out")
    ),
    tag = "Authentication",
    security(
        (),
        ("bearer_auth" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    body: Option<Json<LogoutRequest>>,
) -> StatusCode {
    let refresh_token = body.and_then(|Json(req)| req.refresh_token);
    let access = user.map(|AuthUser(claims)| claims);

    state
        .sessions
        .logout(refresh_token.as_deref(), access.as_ref())
        .await;
    StatusCode::NO_CONTENT
}

/// Claims of the current access token
#[utoipa::path(
    get,
    path = "/auth/session",
    responses(
        (status = 200, description = "Verified claims", body = Claims),
        (status = 401, description = "Missing, invalid or revoked token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn session(AuthUser(claims): AuthUser) -> Json<Claims> {
    Json(claims)
}
