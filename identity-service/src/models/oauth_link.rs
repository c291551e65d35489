//! OAuth link model - binds a provider-scoped subject to a local identity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Unique on `(provider, provider_user_id)`. Provider tokens are stored
/// encrypted; see `services::TokenCipher`.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthLink {
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub access_token_encrypted: Option<String>,
    pub refresh_token_encrypted: Option<String>,
    pub email: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl OAuthLink {
    pub fn new(
        user_id: Uuid,
        provider: &str,
        provider_user_id: &str,
        email: &str,
        access_token_encrypted: Option<String>,
        refresh_token_encrypted: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            provider: provider.to_string(),
            provider_user_id: provider_user_id.to_string(),
            access_token_encrypted,
            refresh_token_encrypted,
            email: email.to_string(),
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Provider entry returned by the providers listing.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LinkedProvider {
    #[schema(example = "google")]
    pub name: String,
    pub linked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}
