use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::auth::{
        MessageResponse, PasswordChangeRequest, PasswordResetConfirm, PasswordResetRequest,
        TokenResponse,
    },
    middleware::AuthUser,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Request a password reset link
#[utoipa::path(
    post,
    path = "/auth/password/reset/request",
    request_body = PasswordResetRequest,
    responses(
        (status = 202, description = "Request accepted", body = MessageResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.passwords.request_reset(&req.email).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "If the email exists, a reset link has been sent",
        )),
    ))
}

/// Set a new password with a reset token
#[utoipa::path(
    post,
    path = "/auth/password/reset/confirm",
    request_body = PasswordResetConfirm,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid or expired token", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirm>,
) -> Result<impl IntoResponse, AppError> {
    state
        .passwords
        .confirm_reset(&req.token, &Password::new(req.new_password))
        .await?;
    Ok((
        StatusCode::OK,
        Json(MessageResponse::new("Password reset successful")),
    ))
}

/// Change the password of the current account
#[utoipa::path(
    post,
    path = "/auth/password/change",
    request_body = PasswordChangeRequest,
    responses(
        (status = 200, description = "Password changed; all other sessions revoked", body = TokenResponse),
        (status = 401, description = "Wrong current password", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(
        ("bearer_auth" = [])
    )
)]
#[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<PasswordChangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tokens = state
        .passwords
        .change_password(
            &claims,
            &Password::new(req.current_password),
            &Password::new(req.new_password),
        )
        .await?;
    Ok((StatusCode::OK, Json(TokenResponse::from(tokens))))
}
