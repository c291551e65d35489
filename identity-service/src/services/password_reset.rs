use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use uuid::Uuid;

use super::database::CredentialStore;
use super::error::ServiceError;
use super::jwt::Claims;
use super::metrics::{self, AuthEvent};
use super::notification::NotificationSender;
use super::revocation::RevocationStore;
use super::session::{SessionManager, SessionTokens};
use crate::models::CodePurpose;
use crate::utils::{hash_password, Password};

const RESET_TOKEN_TTL_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct ResetLimits {
    pub attempts: u64,
    pub window_seconds: u64,
}

/// Password reset by emailed link, and authenticated password change.
#[derive(Clone)]
pub struct PasswordService {
    store: Arc<dyn CredentialStore>,
    revocation: RevocationStore,
    sessions: SessionManager,
    notifier: Arc<dyn NotificationSender>,
    reset_url_base: String,
    limits: ResetLimits,
}

impl PasswordService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        revocation: RevocationStore,
        sessions: SessionManager,
        notifier: Arc<dyn NotificationSender>,
        reset_url_base: String,
        limits: ResetLimits,
    ) -> Self {
        Self {
            store,
            revocation,
            sessions,
            notifier,
            reset_url_base,
            limits,
        }
    }

    /// Never reports whether the address exists. Over-limit requests are
    /// dropped silently.
    #[tracing::instrument(skip_all)]
    pub async fn request_reset(&self, email: &str) -> Result<(), ServiceError> {
        let limit_key = format!("ratelimit:password_reset:{}", email.trim().to_lowercase());
        let decision = self
            .revocation
            .check_and_increment(&limit_key, self.limits.attempts, self.limits.window_seconds)
            .await?;
        if !decision.allowed {
            tracing::warn!("Password reset request dropped by rate limit");
            return Ok(());
        }

        let Some(identity) = self.store.find_identity_by_email(email).await? else {
            tracing::debug!("Password reset requested for unknown address");
            return Ok(());
        };

        let token = generate_reset_token();
        self.revocation
            .cache()
            .set_ex(
                &CodePurpose::Reset.key(&token),
                &identity.user_id.to_string(),
                RESET_TOKEN_TTL_SECONDS,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to store reset token");
                ServiceError::StoreUnavailable
            })?;

        let url = format!("{}?token={}", self.reset_url_base, token);
        if let Err(e) = self.notifier.send_reset_link(&identity.email, &url).await {
            tracing::error!(user_id = %identity.user_id, error = %e, "Failed to send reset link");
        }

        tracing::info!(user_id = %identity.user_id, "Password reset requested");
        Ok(())
    }

    /// Consume the reset token, store the new hash and end every session.
    #[tracing::instrument(skip_all)]
    pub async fn confirm_reset(
        &self,
        token: &str,
        new_password: &Password,
    ) -> Result<(), ServiceError> {
        let user_id = self
            .revocation
            .cache()
            .get_del(&CodePurpose::Reset.key(token))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to read reset token");
                ServiceError::StoreUnavailable
            })?
            .and_then(|v| Uuid::parse_str(&v).ok())
            .ok_or(ServiceError::InvalidResetToken)?;

        let identity = self
            .store
            .find_identity_by_id(user_id)
            .await?
            .ok_or(ServiceError::InvalidResetToken)?;

        let hash = hash_password(new_password)?;
        self.store
            .update_password_hash(identity.user_id, hash.as_str())
            .await?;
        self.sessions.revoke_all(identity.user_id).await?;

        metrics::record(AuthEvent::PasswordReset);
        tracing::info!(user_id = %identity.user_id, "Password reset completed");
        Ok(())
    }

    /// Check the current password, store the new one, revoke every session
    /// and hand the caller a fresh pair.
    #[tracing::instrument(skip_all, fields(user_id = %claims.sub))]
    pub async fn change_password(
        &self,
        claims: &Claims,
        current: &Password,
        new_password: &Password,
    ) -> Result<SessionTokens, ServiceError> {
        let identity = self.sessions.identity_for(claims).await?;
        self.sessions
            .credentials()
            .verify_identity(&identity, current)?;

        let hash = hash_password(new_password)?;
        self.store
            .update_password_hash(identity.user_id, hash.as_str())
            .await?;
        self.sessions.revoke_all(identity.user_id).await?;

        let tokens = self
            .sessions
            .issue_session(&identity, claims.auth_method)
            .await?;
        tracing::info!("Password changed");
        Ok(tokens)
    }
}

fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
