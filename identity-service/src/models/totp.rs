//! TOTP secret model.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-user TOTP seed, stored encrypted. A row with `enabled = false` is a
/// pending enrollment awaiting its first code.
#[derive(Debug, Clone, FromRow)]
pub struct TotpSecret {
    pub user_id: Uuid,
    pub secret_encrypted: String,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
    pub enabled_utc: Option<DateTime<Utc>>,
}

impl TotpSecret {
    pub fn pending(user_id: Uuid, secret_encrypted: String) -> Self {
        Self {
            user_id,
            secret_encrypted,
            enabled: false,
            created_utc: Utc::now(),
            enabled_utc: None,
        }
    }
}
