//! Second factors: TOTP enrollment and checks, backup codes, and
//! out-of-band one-time codes delivered by email or SMS.

use rand::{rngs::OsRng, Rng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::{Choice, ConstantTimeEq};
use totp_rs::{Algorithm, Secret, TOTP};

use super::crypto::TokenCipher;
use super::database::CredentialStore;
use super::error::ServiceError;
use super::metrics::{self, AuthEvent};
use super::notification::NotificationSender;
use super::revocation::RevocationStore;
use crate::models::{CodePurpose, Identity, OtpChannel, TotpSecret};

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;

const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const OTP_TTL_SECONDS: u64 = 600;
const OTP_REQUEST_LIMIT: u64 = 3;
const OTP_REQUEST_WINDOW_SECONDS: u64 = 3600;
const OTP_VERIFY_LIMIT: u64 = 5;
const OTP_VERIFY_WINDOW_SECONDS: u64 = 600;

const LOGIN_ATTEMPT_LIMIT: u64 = 5;
const LOGIN_ATTEMPT_WINDOW_SECONDS: u64 = 300;

/// Returned once at enrollment; the secret is never shown again.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub secret: String,
    pub otpauth_url: String,
    pub recovery_key: String,
}

#[derive(Clone)]
pub struct MfaEngine {
    store: Arc<dyn CredentialStore>,
    cipher: TokenCipher,
    revocation: RevocationStore,
    notifier: Arc<dyn NotificationSender>,
    issuer: String,
}

impl MfaEngine {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: TokenCipher,
        revocation: RevocationStore,
        notifier: Arc<dyn NotificationSender>,
        issuer: String,
    ) -> Self {
        Self {
            store,
            cipher,
            revocation,
            notifier,
            issuer,
        }
    }

    fn build_totp(&self, secret_bytes: Vec<u8>, email: &str) -> Result<TOTP, ServiceError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret_bytes,
            Some(self.issuer.clone()),
            email.to_string(),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build TOTP: {}", e).into())
    }

    fn totp_for(&self, secret: &TotpSecret, email: &str) -> Result<TOTP, ServiceError> {
        let encoded = self.cipher.decrypt(&secret.secret_encrypted)?;
        let bytes = Secret::Encoded(encoded)
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("Stored TOTP secret is corrupt: {:?}", e))?;
        self.build_totp(bytes, email)
    }

    fn totp_matches(totp: &TOTP, code: &str) -> bool {
        totp.check_current(code.trim()).unwrap_or(false)
    }

    #[tracing::instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn enroll(&self, identity: &Identity) -> Result<Enrollment, ServiceError> {
        if identity.mfa_enabled {
            return Err(ServiceError::MfaAlreadyEnabled);
        }

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("Failed to generate TOTP secret: {:?}", e))?;
        let totp = self.build_totp(secret_bytes, &identity.email)?;
        let secret = totp.get_secret_base32();

        let pending = TotpSecret::pending(identity.user_id, self.cipher.encrypt(&secret)?);
        self.store.save_pending_totp(&pending).await?;

        tracing::info!("TOTP enrollment started");
        Ok(Enrollment {
            recovery_key: recovery_key(&secret),
            otpauth_url: totp.get_url(),
            secret,
        })
    }

    /// Confirm the pending secret with a first code. Returns the plaintext
    /// backup codes, which are only ever shown here.
    #[tracing::instrument(skip(self, identity, code), fields(user_id = %identity.user_id))]
    pub async fn verify_enrollment(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let secret = match self.store.get_totp(identity.user_id).await? {
            Some(secret) if secret.enabled => return Err(ServiceError::MfaAlreadyEnabled),
            Some(secret) => secret,
            None => return Err(ServiceError::MfaNotEnrolled),
        };

        let totp = self.totp_for(&secret, &identity.email)?;
        if !Self::totp_matches(&totp, code) {
            return Err(ServiceError::MfaInvalidCode);
        }

        let codes = generate_backup_codes();
        let hashes: Vec<String> = codes.iter().map(|c| hash_backup_code(c)).collect();
        self.store.activate_totp(identity.user_id, &hashes).await?;

        tracing::info!("TOTP enabled");
        Ok(codes)
    }

    /// Turn MFA off. Requires a current TOTP code or an unused backup code.
    #[tracing::instrument(skip(self, identity, code), fields(user_id = %identity.user_id))]
    pub async fn disable(&self, identity: &Identity, code: &str) -> Result<(), ServiceError> {
        let secret = self.enabled_secret(identity).await?;
        let totp = self.totp_for(&secret, &identity.email)?;

        if !Self::totp_matches(&totp, code) && !self.consume_backup_code(identity, code).await? {
            return Err(ServiceError::MfaInvalidCode);
        }

        self.store.delete_totp(identity.user_id).await?;
        tracing::info!("TOTP disabled");
        Ok(())
    }

    #[tracing::instrument(skip(self, identity, code), fields(user_id = %identity.user_id))]
    pub async fn regenerate_backup_codes(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<Vec<String>, ServiceError> {
        let secret = self.enabled_secret(identity).await?;
        let totp = self.totp_for(&secret, &identity.email)?;
        if !Self::totp_matches(&totp, code) {
            return Err(ServiceError::MfaInvalidCode);
        }

        let codes = generate_backup_codes();
        let hashes: Vec<String> = codes.iter().map(|c| hash_backup_code(c)).collect();
        self.store.replace_backup_codes(identity.user_id, &hashes).await?;
        Ok(codes)
    }

    async fn enabled_secret(&self, identity: &Identity) -> Result<TotpSecret, ServiceError> {
        match self.store.get_totp(identity.user_id).await? {
            Some(secret) if secret.enabled && identity.mfa_enabled => Ok(secret),
            _ => Err(ServiceError::MfaNotEnrolled),
        }
    }

    /// Second step of an MFA login. Accepts a TOTP code, a pending
    /// out-of-band code, or an unused backup code. Every attempt is counted
    /// before the code is looked at; a success clears the count.
    #[tracing::instrument(skip(self, identity, code), fields(user_id = %identity.user_id))]
    pub async fn check_login_code(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<(), ServiceError> {
        let attempts_key = format!("ratelimit:mfa:{}", identity.user_id);
        self.revocation
            .check_and_increment(&attempts_key, LOGIN_ATTEMPT_LIMIT, LOGIN_ATTEMPT_WINDOW_SECONDS)
            .await?
            .into_result()?;

        if self.matches_any_factor(identity, code).await? {
            self.revocation.reset_counter(&attempts_key).await;
            return Ok(());
        }

        metrics::record(AuthEvent::MfaFailure);
        tracing::warn!("Invalid second factor");
        Err(ServiceError::MfaInvalidCode)
    }

    async fn matches_any_factor(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<bool, ServiceError> {
        if let Some(secret) = self.store.get_totp(identity.user_id).await? {
            if secret.enabled {
                let totp = self.totp_for(&secret, &identity.email)?;
                if Self::totp_matches(&totp, code) {
                    return Ok(true);
                }
            }
        }

        match self.consume_pending_otp(identity, code).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Could not check one-time code"),
        }

        self.consume_backup_code(identity, code).await
    }

    /// Compare `code` against every stored backup hash without an early exit,
    /// then delete the match. Losing the delete to a concurrent request
    /// counts as no match.
    async fn consume_backup_code(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<bool, ServiceError> {
        let candidate = hash_backup_code(code);
        let stored = self.store.backup_code_hashes(identity.user_id).await?;

        let mut matched: Option<&String> = None;
        let mut any = Choice::from(0);
        for hash in &stored {
            let eq = hash.as_bytes().ct_eq(candidate.as_bytes());
            if bool::from(eq) {
                matched = Some(hash);
            }
            any |= eq;
        }

        match matched {
            Some(hash) if bool::from(any) => {
                let consumed = self.store.consume_backup_code(identity.user_id, hash).await?;
                if consumed {
                    tracing::info!(user_id = %identity.user_id, "Backup code used");
                }
                Ok(consumed)
            }
            _ => Ok(false),
        }
    }

    /// Generate, store and send a six-digit code. Limited to three per hour.
    #[tracing::instrument(skip(self, identity, destination), fields(user_id = %identity.user_id))]
    pub async fn request_otp(
        &self,
        identity: &Identity,
        channel: OtpChannel,
        destination: &str,
    ) -> Result<(), ServiceError> {
        self.revocation
            .check_and_increment(
                &format!("ratelimit:otp:{}", identity.user_id),
                OTP_REQUEST_LIMIT,
                OTP_REQUEST_WINDOW_SECONDS,
            )
            .await?
            .into_result()?;

        let code = generate_otp();
        self.revocation
            .cache()
            .set_ex(
                &CodePurpose::Otp.key(&identity.user_id.to_string()),
                &code,
                OTP_TTL_SECONDS,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to store one-time code");
                ServiceError::StoreUnavailable
            })?;

        if let Err(e) = self.notifier.send_code(channel, destination, &code).await {
            tracing::error!(channel = channel.as_str(), error = %e, "Failed to deliver one-time code");
        }

        tracing::info!(channel = channel.as_str(), "One-time code issued");
        Ok(())
    }

    /// Standalone check of a pending out-of-band code. Limited to five
    /// attempts per ten minutes.
    #[tracing::instrument(skip(self, identity, code), fields(user_id = %identity.user_id))]
    pub async fn verify_otp(&self, identity: &Identity, code: &str) -> Result<(), ServiceError> {
        self.revocation
            .check_and_increment(
                &format!("ratelimit:otp_verify:{}", identity.user_id),
                OTP_VERIFY_LIMIT,
                OTP_VERIFY_WINDOW_SECONDS,
            )
            .await?
            .into_result()?;

        match self.consume_pending_otp(identity, code).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ServiceError::MfaInvalidCode),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read one-time code");
                Err(ServiceError::StoreUnavailable)
            }
        }
    }

    /// Constant-time compare, then `DEL`. Only the caller whose `DEL`
    /// actually removed the key wins.
    async fn consume_pending_otp(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<bool, anyhow::Error> {
        let key = CodePurpose::Otp.key(&identity.user_id.to_string());
        let Some(stored) = self.revocation.cache().get(&key).await? else {
            return Ok(false);
        };

        let matches: bool = stored.as_bytes().ct_eq(code.trim().as_bytes()).into();
        if !matches {
            return Ok(false);
        }

        self.revocation.cache().del(&key).await
    }
}

fn generate_otp() -> String {
    OsRng.gen_range(100_000..=999_999u32).to_string()
}

fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let chars: String = (0..8)
                .map(|_| {
                    let idx = OsRng.gen_range(0..BACKUP_CODE_ALPHABET.len());
                    BACKUP_CODE_ALPHABET[idx] as char
                })
                .collect();
            format!("{}-{}", &chars[..4], &chars[4..])
        })
        .collect()
}

/// SHA-256 hex of the normalized (trimmed, upper-cased) code.
pub fn hash_backup_code(code: &str) -> String {
    let normalized = code.trim().to_ascii_uppercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Base32 secret in groups of four for manual entry.
fn recovery_key(secret: &str) -> String {
    secret
        .as_bytes()
        .chunks(4)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect::<Vec<_>>()
        .join(" ")
}
