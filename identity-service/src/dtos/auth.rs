use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::OtpChannel;
use crate::models::Identity;
use crate::services::{IssuedToken, SessionTokens};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,

    /// TOTP, one-time or backup code, for accounts with MFA enabled.
    #[validate(length(min = 6, max = 16, message = "Code must be 6 to 16 characters"))]
    #[schema(example = "123456")]
    pub mfa_code: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 900)]
    pub expires_in: i64,
    #[schema(example = 2592000)]
    pub refresh_expires_in: i64,
}

impl From<SessionTokens> for TokenResponse {
    fn from(tokens: SessionTokens) -> Self {
        Self {
            expires_in: tokens.access.claims.remaining_seconds(),
            refresh_expires_in: tokens.refresh.claims.remaining_seconds(),
            access_token: tokens.access.token,
            refresh_token: tokens.refresh.token,
            token_type: "Bearer".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(min_length = 8, example = "password123")]
    pub password: String,
}

/// Token pair for a freshly registered account, with its ids.
#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(flatten)]
    pub tokens: TokenResponse,
}

impl RegisterResponse {
    pub fn new(identity: &Identity, tokens: SessionTokens) -> Self {
        Self {
            user_id: identity.user_id,
            tenant_id: identity.tenant_id,
            tokens: tokens.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MfaChallengeResponse {
    #[schema(example = true)]
    pub requires_mfa: bool,
    pub temp_token: String,
    #[schema(example = 300)]
    pub expires_in: i64,
}

impl From<IssuedToken> for MfaChallengeResponse {
    fn from(temp: IssuedToken) -> Self {
        Self {
            requires_mfa: true,
            expires_in: temp.claims.remaining_seconds(),
            temp_token: temp.token,
        }
    }
}

/// Either a full token pair or an MFA challenge.
#[derive(Debug, Serialize, ToSchema)]
#[serde(untagged)]
pub enum LoginResponse {
    Tokens(TokenResponse),
    MfaRequired(MfaChallengeResponse),
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaVerifyRequest {
    #[validate(length(min = 1, message = "Temp token is required"))]
    pub temp_token: String,

    #[validate(length(min = 6, max = 16, message = "Code must be 6 to 16 characters"))]
    #[schema(example = "123456")]
    pub code: String,
}

/// Ask for an out-of-band code while a login waits on its second factor.
#[derive(Debug, Deserialize, Validate, ToSchema)]
#[validate(schema(function = "validate_login_otp_destination"))]
pub struct LoginOtpRequest {
    #[validate(length(min = 1, message = "Temp token is required"))]
    pub temp_token: String,

    pub channel: OtpChannel,

    #[validate(length(min = 6, max = 20, message = "Invalid phone number"))]
    #[schema(example = "+15550100")]
    pub phone: Option<String>,
}

fn validate_login_otp_destination(req: &LoginOtpRequest) -> Result<(), ValidationError> {
    validate_phone_for_channel(req.channel, req.phone.as_deref())
}

/// SMS delivery needs a phone number; email goes to the account address.
pub fn validate_phone_for_channel(
    channel: OtpChannel,
    phone: Option<&str>,
) -> Result<(), ValidationError> {
    match (channel, phone.map(str::trim)) {
        (OtpChannel::Sms, None) | (OtpChannel::Sms, Some("")) => {
            let mut err = ValidationError::new("phone_required");
            err.message = Some("A phone number is required for SMS delivery".into());
            Err(err)
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PasswordResetRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PasswordResetConfirm {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(min_length = 8)]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct PasswordChangeRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(min_length = 8)]
    pub new_password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "If the email exists, a reset link has been sent")]
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sms_requires_phone() {
        let req = LoginOtpRequest {
            temp_token: "t".to_string(),
            channel: OtpChannel::Sms,
            phone: None,
        };
        assert!(req.validate().is_err());

        let req = LoginOtpRequest {
            phone: Some("+15550100".to_string()),
            ..req
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_email_channel_needs_no_phone() {
        let req = LoginOtpRequest {
            temp_token: "t".to_string(),
            channel: OtpChannel::Email,
            phone: None,
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_login_request_rules() {
        let req = LoginRequest {
            email: "not-an-email".to_string(),
            password: String::new(),
            mfa_code: Some("1".to_string()),
        };
        let errors = req.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("password"));
        assert!(fields.contains_key("mfa_code"));
    }
}
