//! Services layer for identity-service.
//!
//! Token codec, revocation store, session manager, MFA engine and OAuth
//! linker, plus the storage, cache and notification seams they sit on.

mod credentials;
pub mod crypto;
pub mod database;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod mfa;
pub mod notification;
pub mod oauth;
mod password_reset;
pub mod redis;
mod revocation;
mod session;

pub use credentials::CredentialVerifier;
pub use crypto::TokenCipher;
pub use database::{CredentialStore, MemoryCredentialStore, PgCredentialStore};
pub use error::ServiceError;
pub use jwt::{AuthMethod, Claims, IssuedToken, Jwks, JwtService, TokenError, TokenKind};
pub use mfa::{Enrollment, MfaEngine};
pub use notification::{
    EmailService, MockNotifier, NotificationSender, Notifier, SentMessage, SmsGateway,
};
pub use oauth::{
    configured_providers, OAuthLinker, OAuthLogin, OAuthProvider, ProviderProfile, StubProvider,
};
pub use password_reset::{PasswordService, ResetLimits};
pub use redis::{CacheStore, MockCache, RedisService};
pub use revocation::{RateDecision, RevocationStore};
pub use session::{destination_for, LoginOutcome, SessionManager, SessionTokens};
