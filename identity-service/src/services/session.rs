use std::sync::Arc;
use uuid::Uuid;

use super::credentials::CredentialVerifier;
use super::database::CredentialStore;
use super::error::ServiceError;
use super::jwt::{AuthMethod, Claims, IssuedToken, JwtService, TokenKind};
use super::metrics::{self, AuthEvent};
use super::mfa::MfaEngine;
use super::revocation::RevocationStore;
use crate::models::{Identity, OtpChannel, Tenant};
use crate::utils::{hash_password, Password};

/// How long one MFA attempt holds its temp token against concurrent use.
const MFA_ATTEMPT_HOLD_SECONDS: u64 = 30;

/// An access/refresh pair issued together.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Tokens(SessionTokens),
    /// Password accepted but a second factor is still owed. Only a
    /// `mfa_pending` token is handed out.
    MfaRequired { temp_token: IssuedToken },
}

#[derive(Clone)]
pub struct SessionManager {
    jwt: Arc<JwtService>,
    revocation: RevocationStore,
    credentials: CredentialVerifier,
    store: Arc<dyn CredentialStore>,
    mfa: MfaEngine,
}

impl SessionManager {
    pub fn new(
        jwt: Arc<JwtService>,
        revocation: RevocationStore,
        store: Arc<dyn CredentialStore>,
        mfa: MfaEngine,
    ) -> Self {
        Self {
            jwt,
            revocation,
            credentials: CredentialVerifier::new(store.clone()),
            store,
            mfa,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub fn credentials(&self) -> &CredentialVerifier {
        &self.credentials
    }

    #[tracing::instrument(skip(self, password, mfa_code))]
    pub async fn login(
        &self,
        email: &str,
        password: &Password,
        mfa_code: Option<&str>,
    ) -> Result<LoginOutcome, ServiceError> {
        let identity = match self.credentials.verify(email, password).await {
            Ok(identity) => identity,
            Err(e) => {
                metrics::record(AuthEvent::LoginFailure);
                tracing::warn!("Login failed");
                return Err(e);
            }
        };

        if !identity.mfa_enabled {
            let tokens = self.issue_session(&identity, AuthMethod::Password).await?;
            metrics::record(AuthEvent::LoginSuccess);
            tracing::info!(user_id = %identity.user_id, "User logged in");
            return Ok(LoginOutcome::Tokens(tokens));
        }

        match mfa_code {
            Some(code) => {
                self.mfa.check_login_code(&identity, code).await?;
                let tokens = self.issue_session(&identity, AuthMethod::Mfa).await?;
                metrics::record(AuthEvent::LoginSuccess);
                tracing::info!(user_id = %identity.user_id, "User logged in with second factor");
                Ok(LoginOutcome::Tokens(tokens))
            }
            None => {
                let temp_token = self
                    .jwt
                    .issue(&identity, TokenKind::MfaPending, AuthMethod::Password)?;
                self.revocation
                    .track_session(identity.user_id, &temp_token.claims.jti, temp_token.claims.exp)
                    .await;
                metrics::record(AuthEvent::MfaChallenge);
                tracing::info!(user_id = %identity.user_id, "Second factor required");
                Ok(LoginOutcome::MfaRequired { temp_token })
            }
        }
    }

    /// Create an email/password identity in a tenant of its own and sign it
    /// straight in.
    #[tracing::instrument(skip(self, password))]
    pub async fn register(
        &self,
        email: &str,
        password: &Password,
    ) -> Result<(Identity, SessionTokens), ServiceError> {
        let hash = hash_password(password)?.into_string();
        let tenant = Tenant::personal(email);
        let identity = Identity::new_with_password(tenant.tenant_id, email.to_string(), hash);

        self.store.create_password_identity(&tenant, &identity).await?;

        let tokens = self.issue_session(&identity, AuthMethod::Password).await?;
        metrics::record(AuthEvent::Registration);
        tracing::info!(user_id = %identity.user_id, tenant_id = %tenant.tenant_id, "User registered");
        Ok((identity, tokens))
    }

    /// Verify a `mfa_pending` token and load the identity it was issued for.
    async fn pending_identity(&self, temp_token: &str) -> Result<(Claims, Identity), ServiceError> {
        let claims = self.jwt.verify(temp_token)?;
        if claims.token_type != TokenKind::MfaPending {
            return Err(ServiceError::InvalidTokenType);
        }
        if self.revocation.is_revoked(&claims.jti).await? {
            return Err(ServiceError::TokenRevoked);
        }

        let identity = self
            .store
            .find_identity_by_id(claims.sub)
            .await?
            .ok_or(ServiceError::InvalidCredentials)?;
        Ok((claims, identity))
    }

    /// Second step of an MFA login. The temp token is single use, and only
    /// one attempt per temp token runs at a time, so a replayed token is
    /// turned away before it can consume a backup or one-time code.
    #[tracing::instrument(skip(self, temp_token, code))]
    pub async fn verify_mfa(
        &self,
        temp_token: &str,
        code: &str,
    ) -> Result<SessionTokens, ServiceError> {
        let (claims, identity) = self.pending_identity(temp_token).await?;

        let hold = format!("mfa_attempt:{}", claims.jti);
        if !self.revocation.acquire(&hold, MFA_ATTEMPT_HOLD_SECONDS).await? {
            tracing::warn!(user_id = %identity.user_id, "Concurrent use of MFA token");
            return Err(ServiceError::TokenRevoked);
        }

        let result = self.complete_mfa(&claims, &identity, code).await;
        if result.is_err() {
            self.revocation.release(&hold).await;
        }
        result
    }

    async fn complete_mfa(
        &self,
        claims: &Claims,
        identity: &Identity,
        code: &str,
    ) -> Result<SessionTokens, ServiceError> {
        // Checked again under the hold: a replay that raced past the first
        // check must not get to spend a code.
        if self.revocation.is_revoked(&claims.jti).await? {
            return Err(ServiceError::TokenRevoked);
        }

        self.mfa.check_login_code(identity, code).await?;

        if !self.revocation.claim(&claims.jti, claims.exp).await? {
            tracing::warn!(user_id = %identity.user_id, "MFA token replayed");
            return Err(ServiceError::TokenRevoked);
        }
        self.revocation.untrack_session(identity.user_id, &claims.jti).await;

        let tokens = self.issue_session(identity, AuthMethod::Mfa).await?;
        metrics::record(AuthEvent::LoginSuccess);
        tracing::info!(user_id = %identity.user_id, "User logged in with second factor");
        Ok(tokens)
    }

    /// Send an out-of-band code for a login that is waiting on its second
    /// factor.
    #[tracing::instrument(skip(self, temp_token, phone))]
    pub async fn send_login_otp(
        &self,
        temp_token: &str,
        channel: OtpChannel,
        phone: Option<&str>,
    ) -> Result<(), ServiceError> {
        let (_, identity) = self.pending_identity(temp_token).await?;
        let destination = destination_for(&identity, channel, phone)?;
        self.mfa.request_otp(&identity, channel, &destination).await
    }

    /// Rotate a refresh token. Everything that can fail is done before the
    /// old jti is claimed, so a failed rotation leaves the token usable and a
    /// retry is not mistaken for theft. A jti that is already claimed means
    /// the token was replayed.
    #[tracing::instrument(skip(self, refresh_token))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, ServiceError> {
        let claims = self.jwt.verify(refresh_token)?;
        if claims.token_type != TokenKind::Refresh {
            return Err(ServiceError::InvalidTokenType);
        }

        let identity = self
            .store
            .find_identity_by_id(claims.sub)
            .await?
            .ok_or(ServiceError::InvalidCredentials)?;
        let tokens = self.sign_pair(&identity, claims.auth_method)?;

        if !self.revocation.claim(&claims.jti, claims.exp).await? {
            metrics::record(AuthEvent::ReuseDetected);
            tracing::warn!(
                user_id = %claims.sub,
                jti = %claims.jti,
                "Refresh token reuse detected, revoking all sessions"
            );
            if let Err(e) = self.revocation.revoke_all(claims.sub).await {
                tracing::error!(user_id = %claims.sub, error = %e, "Failed to revoke sessions after reuse");
            }
            return Err(ServiceError::TokenReuseDetected);
        }

        self.revocation.untrack_session(claims.sub, &claims.jti).await;
        self.track_pair(&identity, &tokens).await;
        metrics::record(AuthEvent::Refresh);
        tracing::info!(user_id = %identity.user_id, "Token refreshed");
        Ok(tokens)
    }

    /// Best effort. Nothing here is reported back to the caller.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, refresh_token: Option<&str>, access: Option<&Claims>) {
        if let Some(token) = refresh_token {
            match self.jwt.verify(token) {
                Ok(claims) if claims.token_type == TokenKind::Refresh => {
                    match self.revocation.revoke(&claims.jti, claims.exp).await {
                        Ok(()) => self.revocation.untrack_session(claims.sub, &claims.jti).await,
                        Err(e) => tracing::warn!(error = %e, "Failed to revoke refresh token on logout"),
                    }
                }
                Ok(_) => tracing::debug!("Logout called with a non-refresh token"),
                Err(e) => tracing::debug!(error = %e, "Logout called with an invalid refresh token"),
            }
        }

        if let Some(claims) = access {
            match self.revocation.revoke(&claims.jti, claims.exp).await {
                Ok(()) => self.revocation.untrack_session(claims.sub, &claims.jti).await,
                Err(e) => tracing::warn!(error = %e, "Failed to revoke access token on logout"),
            }
            tracing::info!(user_id = %claims.sub, "User logged out");
        }
    }

    /// Bearer check used by the auth middleware.
    pub async fn authenticate(&self, bearer: &str) -> Result<Claims, ServiceError> {
        let claims = self.jwt.verify(bearer)?;
        match claims.token_type {
            TokenKind::Access => {}
            TokenKind::MfaPending => return Err(ServiceError::MfaRequired),
            TokenKind::Refresh => return Err(ServiceError::InvalidTokenType),
        }

        if self.revocation.is_revoked(&claims.jti).await? {
            return Err(ServiceError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Sign a fresh pair and index both jtis for revoke-all.
    pub async fn issue_session(
        &self,
        identity: &Identity,
        auth_method: AuthMethod,
    ) -> Result<SessionTokens, ServiceError> {
        let tokens = self.sign_pair(identity, auth_method)?;
        self.track_pair(identity, &tokens).await;
        Ok(tokens)
    }

    fn sign_pair(
        &self,
        identity: &Identity,
        auth_method: AuthMethod,
    ) -> Result<SessionTokens, ServiceError> {
        Ok(SessionTokens {
            access: self.jwt.issue(identity, TokenKind::Access, auth_method)?,
            refresh: self.jwt.issue(identity, TokenKind::Refresh, auth_method)?,
        })
    }

    async fn track_pair(&self, identity: &Identity, tokens: &SessionTokens) {
        for token in [&tokens.access, &tokens.refresh] {
            self.revocation
                .track_session(identity.user_id, &token.claims.jti, token.claims.exp)
                .await;
        }
    }

    pub async fn revoke_all(&self, user_id: Uuid) -> Result<usize, ServiceError> {
        self.revocation.revoke_all(user_id).await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "Failed to revoke sessions");
            ServiceError::StoreUnavailable
        })
    }

    /// Load the identity behind verified access claims.
    pub async fn identity_for(&self, claims: &Claims) -> Result<Identity, ServiceError> {
        self.store
            .find_identity_by_id(claims.sub)
            .await?
            .ok_or(ServiceError::InvalidCredentials)
    }
}

/// Where a one-time code goes: the account email, or the supplied phone.
pub fn destination_for(
    identity: &Identity,
    channel: OtpChannel,
    phone: Option<&str>,
) -> Result<String, ServiceError> {
    match channel {
        OtpChannel::Email => Ok(identity.email.clone()),
        OtpChannel::Sms => phone
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .ok_or(ServiceError::PhoneRequired),
    }
}
