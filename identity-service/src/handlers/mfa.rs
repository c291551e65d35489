//! MFA management for the signed-in account.

use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::{
        auth::MessageResponse,
        mfa::{BackupCodesResponse, CodeRequest, EnrollResponse, OtpRequest},
    },
    middleware::AuthUser,
    services::destination_for,
    utils::ValidatedJson,
    AppState,
};

/// Start TOTP enrollment
#[utoipa::path(
    post,
    path = "/auth/totp/enroll",
    responses(
        (status = 200, description = "Pending secret created", body = EnrollResponse),
        (status = 409, description = "MFA already enabled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn enroll_totp(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    let enrollment = state.mfa.enroll(&identity).await?;
    Ok((StatusCode::OK, Json(EnrollResponse::from(enrollment))))
}

/// Confirm TOTP enrollment and receive backup codes
#[utoipa::path(
    post,
    path = "/auth/totp/verify",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "MFA enabled", body = BackupCodesResponse),
        (status = 400, description = "No pending enrollment", body = ErrorResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn verify_totp(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    let backup_codes = state.mfa.verify_enrollment(&identity, &req.code).await?;
    Ok((StatusCode::OK, Json(BackupCodesResponse { backup_codes })))
}

/// Turn MFA off
#[utoipa::path(
    post,
    path = "/auth/totp/disable",
    request_body = CodeRequest,
    responses(
        (status = 204, description = "MFA disabled"),
        (status = 400, description = "MFA not enabled", body = ErrorResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn disable_totp(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<CodeRequest>,
) -> Result<StatusCode, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    state.mfa.disable(&identity, &req.code).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Replace all backup codes
#[utoipa::path(
    post,
    path = "/auth/totp/backup-codes",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "New backup codes", body = BackupCodesResponse),
        (status = 400, description = "MFA not enabled", body = ErrorResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn regenerate_backup_codes(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    let backup_codes = state.mfa.regenerate_backup_codes(&identity, &req.code).await?;
    Ok((StatusCode::OK, Json(BackupCodesResponse { backup_codes })))
}

/// Send a one-time code by email or SMS
#[utoipa::path(
    post,
    path = "/auth/otp/request",
    request_body = OtpRequest,
    responses(
        (status = 202, description = "Code sent", body = MessageResponse),
        (status = 429, description = "Too many codes requested", body = ErrorResponse),
        (status = 503, description = "Cache unavailable", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn request_otp(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<OtpRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    let destination = destination_for(&identity, req.channel, req.phone.as_deref())?;
    state
        .mfa
        .request_otp(&identity, req.channel, &destination)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("Verification code sent")),
    ))
}

/// Check a one-time code
#[utoipa::path(
    post,
    path = "/auth/otp/verify",
    request_body = CodeRequest,
    responses(
        (status = 200, description = "Code accepted", body = MessageResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn verify_otp(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<CodeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.sessions.identity_for(&claims).await?;
    state.mfa.verify_otp(&identity, &req.code).await?;
    Ok((StatusCode::OK, Json(MessageResponse::new("Code verified"))))
}
