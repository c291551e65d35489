use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rsa::{pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey, traits::PublicKeyParts, RsaPublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::Identity;

/// The only accepted signing algorithm, as it appears in the JOSE header.
const ACCEPTED_ALG: &str = "RS256";

/// Why a presented token was rejected.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,
    #[error("Token signature is invalid")]
    InvalidSignature,
    #[error("Token algorithm is not accepted")]
    InvalidAlgorithm,
    #[error("Token is malformed")]
    Malformed,
    #[error("Token is missing required claims")]
    MissingClaims,
}

impl TokenError {
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::Expired => "token_expired",
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::InvalidAlgorithm => "invalid_algorithm",
            TokenError::Malformed => "malformed_token",
            TokenError::MissingClaims => "missing_claims",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                TokenError::InvalidAlgorithm
            }
            ErrorKind::MissingRequiredClaim(_) => TokenError::MissingClaims,
            _ => TokenError::Malformed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    MfaPending,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::MfaPending => "mfa_pending",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Mfa,
    OAuth,
}

/// Verified claim set. Every field is present; tokens that lack one of
/// them never make it this far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Claims {
    pub sub: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub token_type: TokenKind,
    pub auth_method: AuthMethod,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    /// Seconds until expiry, never negative.
    pub fn remaining_seconds(&self) -> i64 {
        (self.exp - Utc::now().timestamp()).max(0)
    }
}

/// Wire shape of the payload before validation.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    tenant_id: Option<String>,
    email: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
    jti: Option<String>,
    token_type: Option<TokenKind>,
    auth_method: Option<AuthMethod>,
    iss: Option<String>,
    aud: Option<String>,
}

impl TryFrom<RawClaims> for Claims {
    type Error = TokenError;

    fn try_from(raw: RawClaims) -> Result<Self, Self::Error> {
        let sub = raw.sub.ok_or(TokenError::MissingClaims)?;
        let tenant_id = raw.tenant_id.ok_or(TokenError::MissingClaims)?;

        Ok(Claims {
            sub: Uuid::parse_str(&sub).map_err(|_| TokenError::Malformed)?,
            tenant_id: Uuid::parse_str(&tenant_id).map_err(|_| TokenError::Malformed)?,
            email: raw.email.ok_or(TokenError::MissingClaims)?,
            iat: raw.iat.ok_or(TokenError::MissingClaims)?,
            exp: raw.exp.ok_or(TokenError::MissingClaims)?,
            jti: raw.jti.ok_or(TokenError::MissingClaims)?,
            token_type: raw.token_type.ok_or(TokenError::MissingClaims)?,
            auth_method: raw.auth_method.ok_or(TokenError::MissingClaims)?,
            iss: raw.iss.ok_or(TokenError::MissingClaims)?,
            aud: raw.aud.ok_or(TokenError::MissingClaims)?,
        })
    }
}

/// A freshly signed token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// RS256 token codec. Keys are read once at construction and never change.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwks: Jwks,
    key_id: String,
    issuer: String,
    audience: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
    mfa_token_expiry_minutes: i64,
    leeway_seconds: u64,
}

impl JwtService {
    /// Load the RSA key pair from the PEM files named in the config.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;
        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        let service = Self::from_pem(config, &private_key_pem, &public_key_pem)?;
        tracing::info!(kid = %config.key_id, "JWT service initialized with RS256 keys");
        Ok(service)
    }

    pub fn from_pem(
        config: &JwtConfig,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;
        let jwks = build_jwks(public_key_pem, &config.key_id)?;

        Ok(Self {
            encoding_key,
            decoding_key,
            jwks,
            key_id: config.key_id.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
            mfa_token_expiry_minutes: config.mfa_token_expiry_minutes,
            leeway_seconds: config.leeway_seconds,
        })
    }

    pub fn lifetime(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => Duration::minutes(self.access_token_expiry_minutes),
            TokenKind::Refresh => Duration::days(self.refresh_token_expiry_days),
            TokenKind::MfaPending => Duration::minutes(self.mfa_token_expiry_minutes),
        }
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_token_expiry_seconds(&self) -> i64 {
        self.lifetime(TokenKind::Refresh).num_seconds()
    }

    /// Sign a token of `kind` for `identity`. The tenant is taken from the
    /// identity as it is right now.
    pub fn issue(
        &self,
        identity: &Identity,
        kind: TokenKind,
        auth_method: AuthMethod,
    ) -> Result<IssuedToken, anyhow::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity.user_id,
            tenant_id: identity.tenant_id,
            email: identity.email.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifetime(kind)).timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: kind,
            auth_method,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        let token = self.sign(&claims)?;
        Ok(IssuedToken { token, claims })
    }

    fn sign(&self, claims: &Claims) -> Result<String, anyhow::Error> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());

        encode(&header, claims, &self.encoding_key).map_err(|e| {
            anyhow::anyhow!(
                "Failed to encode {} token: {}",
                claims.token_type.as_str(),
                e
            )
        })
    }

    /// Verify signature, algorithm, expiry, issue time, issuer and audience.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        check_header_algorithm(token)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.leeway_seconds;
        validation.validate_exp = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let data = decode::<RawClaims>(token, &self.decoding_key, &validation)?;
        let claims = Claims::try_from(data.claims)?;

        if claims.iat > Utc::now().timestamp() + self.leeway_seconds as i64 {
            return Err(TokenError::Malformed);
        }

        Ok(claims)
    }

    pub fn get_jwks(&self) -> &Jwks {
        &self.jwks
    }
}

/// Reject on the declared `alg` before any signature work. Names that the
/// JWT library cannot even parse (`none`, made-up ones) land here too.
fn check_header_algorithm(token: &str) -> Result<(), TokenError> {
    let header_segment = token.split('.').next().ok_or(TokenError::Malformed)?;
    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_segment)
        .map_err(|_| TokenError::Malformed)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;

    match header.get("alg").and_then(|alg| alg.as_str()) {
        Some(ACCEPTED_ALG) => Ok(()),
        _ => Err(TokenError::InvalidAlgorithm),
    }
}

fn build_jwks(public_key_pem: &str, key_id: &str) -> Result<Jwks, anyhow::Error> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| anyhow::anyhow!("Failed to decode RSA public key for JWKS: {}", e))?;

    Ok(Jwks {
        keys: vec![Jwk {
            kty: "RSA".to_string(),
            use_: "sig".to_string(),
            alg: ACCEPTED_ALG.to_string(),
            kid: key_id.to_string(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }],
    })
}
