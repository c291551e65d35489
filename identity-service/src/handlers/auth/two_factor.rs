use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{LoginOtpRequest, MessageResponse, MfaVerifyRequest, TokenResponse},
    utils::ValidatedJson,
    AppState,
};

/// Complete an MFA login with a TOTP, one-time or backup code
#[utoipa::path(
    post,
    path = "/auth/2fa/verify",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Login complete", body = TokenResponse),
        (status = 401, description = "Invalid temp token or code", body = ErrorResponse),
        (status = 429, description = "Too many failed codes", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn verify_login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<MfaVerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tokens = state.sessions.verify_mfa(&req.temp_token, &req.code).await?;
    Ok((StatusCode::OK, Json(TokenResponse::from(tokens))))
}

/// Send a one-time code for a pending MFA login
#[utoipa::path(
    post,
    path = "/auth/2fa/otp",
    request_body = LoginOtpRequest,
    responses(
        (status = 202, description = "Code sent", body = MessageResponse),
        (status = 401, description = "Invalid temp token", body = ErrorResponse),
        (status = 429, description = "Too many codes requested", body = ErrorResponse),
        (status = 503, description = "Cache unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all, fields(channel = req.channel.as_str()))]
pub async fn send_login_code(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginOtpRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .sessions
        .send_login_otp(&req.temp_token, req.channel, req.phone.as_deref())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("Verification code sent")),
    ))
}
