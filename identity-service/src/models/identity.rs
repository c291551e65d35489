//! Identity and tenant records owned by the credential store.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// A local account. `password_hash` is `None` for identities provisioned
/// purely through an OAuth provider.
#[derive(Debug, Clone, FromRow)]
pub struct Identity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub mfa_enabled: bool,
    pub created_utc: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// New OAuth-only identity inside `tenant_id`.
    pub fn new_oauth(tenant_id: Uuid, email: String) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            tenant_id,
            email,
            password_hash: None,
            mfa_enabled: false,
            created_utc: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn new_with_password(tenant_id: Uuid, email: String, password_hash: String) -> Self {
        Self {
            password_hash: Some(password_hash),
            ..Self::new_oauth(tenant_id, email)
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

impl Tenant {
    /// Personal tenant for a freshly provisioned identity, named after the
    /// mailbox part of the email.
    pub fn personal(email: &str) -> Self {
        let owner = email.split('@').next().unwrap_or(email);
        Self {
            tenant_id: Uuid::new_v4(),
            name: format!("{}'s workspace", owner),
            created_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_identity_has_no_password() {
        let identity = Identity::new_oauth(Uuid::new_v4(), "a@example.com".to_string());
        assert!(!identity.has_password());
        assert!(!identity.mfa_enabled);
        assert!(!identity.is_deleted());
    }

    #[test]
    fn test_personal_tenant_name() {
        assert_eq!(Tenant::personal("ana@example.com").name, "ana's workspace");
    }
}
