//! Credential store: identities, tenants, OAuth links and second factors.
//!
//! `PgCredentialStore` is the production implementation on sqlx/PostgreSQL.
//! `MemoryCredentialStore` is a test double that mirrors its semantics
//! in-process.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::{Identity, OAuthLink, Tenant, TotpSecret};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Case-insensitive lookup. Soft-deleted identities are never returned.
    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, ServiceError>;
    async fn find_identity_by_id(&self, user_id: Uuid) -> Result<Option<Identity>, ServiceError>;

    async fn find_link(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthLink>, ServiceError>;
    async fn list_links(&self, user_id: Uuid) -> Result<Vec<OAuthLink>, ServiceError>;
    /// Insert, or refresh tokens and email of the existing `(provider, provider_user_id)` row.
    async fn upsert_link(&self, link: &OAuthLink) -> Result<(), ServiceError>;
    async fn delete_link(&self, user_id: Uuid, provider: &str) -> Result<bool, ServiceError>;
    /// Create a tenant and an email/password identity in one transaction.
    /// A live identity with the same email yields `EmailTaken`.
    async fn create_password_identity(
        &self,
        tenant: &Tenant,
        identity: &Identity,
    ) -> Result<(), ServiceError>;
    /// Create tenant, identity and link in one transaction.
    async fn create_oauth_identity(
        &self,
        tenant: &Tenant,
        identity: &Identity,
        link: &OAuthLink,
    ) -> Result<(), ServiceError>;

    async fn get_totp(&self, user_id: Uuid) -> Result<Option<TotpSecret>, ServiceError>;
    /// Store a not-yet-enabled secret, replacing any previous pending one.
    async fn save_pending_totp(&self, secret: &TotpSecret) -> Result<(), ServiceError>;
    /// Enable the pending secret, flag the identity and install `backup_hashes`.
    async fn activate_totp(&self, user_id: Uuid, backup_hashes: &[String])
        -> Result<(), ServiceError>;
    /// Remove the secret and all backup codes and clear the identity's MFA flag.
    async fn delete_totp(&self, user_id: Uuid) -> Result<(), ServiceError>;

    async fn backup_code_hashes(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError>;
    async fn replace_backup_codes(&self, user_id: Uuid, hashes: &[String])
        -> Result<(), ServiceError>;
    /// Delete one backup code. `Ok(false)` means it was already gone.
    async fn consume_backup_code(&self, user_id: Uuid, hash: &str) -> Result<bool, ServiceError>;

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError>;
}

/// PostgreSQL credential store.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const IDENTITY_COLUMNS: &str =
    "user_id, tenant_id, email, password_hash, mfa_enabled, created_utc, deleted_at";

const LINK_COLUMNS: &str = "user_id, provider, provider_user_id, access_token_encrypted, \
     refresh_token_encrypted, email, created_utc, updated_utc";

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, ServiceError> {
        let query = format!(
            "SELECT {} FROM identities WHERE LOWER(email) = LOWER($1) AND deleted_at IS NULL",
            IDENTITY_COLUMNS
        );
        Ok(sqlx::query_as::<_, Identity>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_identity_by_id(&self, user_id: Uuid) -> Result<Option<Identity>, ServiceError> {
        let query = format!(
            "SELECT {} FROM identities WHERE user_id = $1 AND deleted_at IS NULL",
            IDENTITY_COLUMNS
        );
        Ok(sqlx::query_as::<_, Identity>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_link(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthLink>, ServiceError> {
        let query = format!(
            "SELECT {} FROM oauth_links WHERE provider = $1 AND provider_user_id = $2",
            LINK_COLUMNS
        );
        Ok(sqlx::query_as::<_, OAuthLink>(&query)
            .bind(provider)
            .bind(provider_user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_links(&self, user_id: Uuid) -> Result<Vec<OAuthLink>, ServiceError> {
        let query = format!(
            "SELECT {} FROM oauth_links WHERE user_id = $1 ORDER BY provider",
            LINK_COLUMNS
        );
        Ok(sqlx::query_as::<_, OAuthLink>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn upsert_link(&self, link: &OAuthLink) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_links (user_id, provider, provider_user_id, access_token_encrypted,
                                     refresh_token_encrypted, email, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (provider, provider_user_id) DO UPDATE SET
                access_token_encrypted = EXCLUDED.access_token_encrypted,
                refresh_token_encrypted = COALESCE(EXCLUDED.refresh_token_encrypted,
                                                   oauth_links.refresh_token_encrypted),
                email = EXCLUDED.email,
                updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(link.user_id)
        .bind(&link.provider)
        .bind(&link.provider_user_id)
        .bind(&link.access_token_encrypted)
        .bind(&link.refresh_token_encrypted)
        .bind(&link.email)
        .bind(link.created_utc)
        .bind(link.updated_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_link(&self, user_id: Uuid, provider: &str) -> Result<bool, ServiceError> {
        let result = sqlx::query("DELETE FROM oauth_links WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_password_identity(
        &self,
        tenant: &Tenant,
        identity: &Identity,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (tenant_id, name, created_utc) VALUES ($1, $2, $3)")
            .bind(tenant.tenant_id)
            .bind(&tenant.name)
            .bind(tenant.created_utc)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO identities (user_id, tenant_id, email, password_hash, mfa_enabled, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(identity.user_id)
        .bind(identity.tenant_id)
        .bind(&identity.email)
        .bind(&identity.password_hash)
        .bind(identity.mfa_enabled)
        .bind(identity.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => ServiceError::EmailTaken,
            other => ServiceError::Database(other),
        })?;

        tx.commit().await?;
        tracing::info!(user_id = %identity.user_id, tenant_id = %tenant.tenant_id, "Created password identity");
        Ok(())
    }

    async fn create_oauth_identity(
        &self,
        tenant: &Tenant,
        identity: &Identity,
        link: &OAuthLink,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (tenant_id, name, created_utc) VALUES ($1, $2, $3)")
            .bind(tenant.tenant_id)
            .bind(&tenant.name)
            .bind(tenant.created_utc)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO identities (user_id, tenant_id, email, password_hash, mfa_enabled, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(identity.user_id)
        .bind(identity.tenant_id)
        .bind(&identity.email)
        .bind(&identity.password_hash)
        .bind(identity.mfa_enabled)
        .bind(identity.created_utc)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO oauth_links (user_id, provider, provider_user_id, access_token_encrypted,
                                     refresh_token_encrypted, email, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(link.user_id)
        .bind(&link.provider)
        .bind(&link.provider_user_id)
        .bind(&link.access_token_encrypted)
        .bind(&link.refresh_token_encrypted)
        .bind(&link.email)
        .bind(link.created_utc)
        .bind(link.updated_utc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_totp(&self, user_id: Uuid) -> Result<Option<TotpSecret>, ServiceError> {
        Ok(sqlx::query_as::<_, TotpSecret>(
            "SELECT user_id, secret_encrypted, enabled, created_utc, enabled_utc \
             FROM totp_secrets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn save_pending_totp(&self, secret: &TotpSecret) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO totp_secrets (user_id, secret_encrypted, enabled, created_utc)
            VALUES ($1, $2, FALSE, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                secret_encrypted = EXCLUDED.secret_encrypted,
                created_utc = EXCLUDED.created_utc
            WHERE totp_secrets.enabled = FALSE
            "#,
        )
        .bind(secret.user_id)
        .bind(&secret.secret_encrypted)
        .bind(secret.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate_totp(
        &self,
        user_id: Uuid,
        backup_hashes: &[String],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE totp_secrets SET enabled = TRUE, enabled_utc = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE identities SET mfa_enabled = TRUE WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO backup_codes (user_id, code_hash) SELECT $1, UNNEST($2::text[])")
            .bind(user_id)
            .bind(backup_hashes)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_totp(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM totp_secrets WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE identities SET mfa_enabled = FALSE WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn backup_code_hashes(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT code_hash FROM backup_codes WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        hashes: &[String],
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO backup_codes (user_id, code_hash) SELECT $1, UNNEST($2::text[])")
            .bind(user_id)
            .bind(hashes)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn consume_backup_code(&self, user_id: Uuid, hash: &str) -> Result<bool, ServiceError> {
        let deleted = sqlx::query_scalar::<_, String>(
            "DELETE FROM backup_codes WHERE user_id = $1 AND code_hash = $2 RETURNING code_hash",
        )
        .bind(user_id)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deleted.is_some())
    }

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE identities SET password_hash = $2 WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            ServiceError::Database(e)
        })?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    identities: HashMap<Uuid, Identity>,
    links: Vec<OAuthLink>,
    totp: HashMap<Uuid, TotpSecret>,
    backup_codes: HashMap<Uuid, Vec<String>>,
}

/// Test double: an in-process credential store with the same uniqueness
/// rules as the schema. `set_available(false)` makes every call fail, which
/// is how database outages are simulated. Not wired into the binary.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, ServiceError>,
    ) -> Result<T, ServiceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Memory store unavailable").into());
        }
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store mutex poisoned: {}", e))?;
        f(&mut state)
    }

    /// Seed an identity together with a tenant for it.
    pub fn insert_identity(&self, identity: Identity) -> Result<(), ServiceError> {
        self.with_state(|state| {
            state.tenants.entry(identity.tenant_id).or_insert_with(|| Tenant {
                tenant_id: identity.tenant_id,
                name: "seeded".to_string(),
                created_utc: Utc::now(),
            });
            state.identities.insert(identity.user_id, identity);
            Ok(())
        })
    }

    pub fn soft_delete(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.with_state(|state| {
            if let Some(identity) = state.identities.get_mut(&user_id) {
                identity.deleted_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    pub fn counts(&self) -> Result<(usize, usize, usize), ServiceError> {
        self.with_state(|state| {
            Ok((state.tenants.len(), state.identities.len(), state.links.len()))
        })
    }
}

fn live(identity: &Identity) -> bool {
    !identity.is_deleted()
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, ServiceError> {
        self.with_state(|state| {
            Ok(state
                .identities
                .values()
                .find(|i| live(i) && i.email.eq_ignore_ascii_case(email))
                .cloned())
        })
    }

    async fn find_identity_by_id(&self, user_id: Uuid) -> Result<Option<Identity>, ServiceError> {
        self.with_state(|state| Ok(state.identities.get(&user_id).filter(|i| live(i)).cloned()))
    }

    async fn find_link(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OAuthLink>, ServiceError> {
        self.with_state(|state| {
            Ok(state
                .links
                .iter()
                .find(|l| l.provider == provider && l.provider_user_id == provider_user_id)
                .cloned())
        })
    }

    async fn list_links(&self, user_id: Uuid) -> Result<Vec<OAuthLink>, ServiceError> {
        self.with_state(|state| {
            let mut links: Vec<OAuthLink> = state
                .links
                .iter()
                .filter(|l| l.user_id == user_id)
                .cloned()
                .collect();
            links.sort_by(|a, b| a.provider.cmp(&b.provider));
            Ok(links)
        })
    }

    async fn upsert_link(&self, link: &OAuthLink) -> Result<(), ServiceError> {
        self.with_state(|state| {
            match state.links.iter_mut().find(|l| {
                l.provider == link.provider && l.provider_user_id == link.provider_user_id
            }) {
                Some(existing) => {
                    existing.access_token_encrypted = link.access_token_encrypted.clone();
                    if link.refresh_token_encrypted.is_some() {
                        existing.refresh_token_encrypted = link.refresh_token_encrypted.clone();
                    }
                    existing.email = link.email.clone();
                    existing.updated_utc = link.updated_utc;
                }
                None => state.links.push(link.clone()),
            }
            Ok(())
        })
    }

    async fn delete_link(&self, user_id: Uuid, provider: &str) -> Result<bool, ServiceError> {
        self.with_state(|state| {
            let before = state.links.len();
            state
                .links
                .retain(|l| !(l.user_id == user_id && l.provider == provider));
            Ok(state.links.len() < before)
        })
    }

    async fn create_password_identity(
        &self,
        tenant: &Tenant,
        identity: &Identity,
    ) -> Result<(), ServiceError> {
        self.with_state(|state| {
            let duplicate_email = state
                .identities
                .values()
                .any(|i| live(i) && i.email.eq_ignore_ascii_case(&identity.email));
            if duplicate_email {
                return Err(ServiceError::EmailTaken);
            }

            state.tenants.insert(tenant.tenant_id, tenant.clone());
            state.identities.insert(identity.user_id, identity.clone());
            Ok(())
        })
    }

    async fn create_oauth_identity(
        &self,
        tenant: &Tenant,
        identity: &Identity,
        link: &OAuthLink,
    ) -> Result<(), ServiceError> {
        self.with_state(|state| {
            let duplicate_link = state.links.iter().any(|l| {
                l.provider == link.provider && l.provider_user_id == link.provider_user_id
            });
            let duplicate_email = state
                .identities
                .values()
                .any(|i| live(i) && i.email.eq_ignore_ascii_case(&identity.email));
            if duplicate_link || duplicate_email {
                return Err(anyhow::anyhow!("unique constraint violated").into());
            }

            state.tenants.insert(tenant.tenant_id, tenant.clone());
            state.identities.insert(identity.user_id, identity.clone());
            state.links.push(link.clone());
            Ok(())
        })
    }

    async fn get_totp(&self, user_id: Uuid) -> Result<Option<TotpSecret>, ServiceError> {
        self.with_state(|state| Ok(state.totp.get(&user_id).cloned()))
    }

    async fn save_pending_totp(&self, secret: &TotpSecret) -> Result<(), ServiceError> {
        self.with_state(|state| {
            let enabled = state.totp.get(&secret.user_id).is_some_and(|s| s.enabled);
            if !enabled {
                state.totp.insert(secret.user_id, secret.clone());
            }
            Ok(())
        })
    }

    async fn activate_totp(
        &self,
        user_id: Uuid,
        backup_hashes: &[String],
    ) -> Result<(), ServiceError> {
        self.with_state(|state| {
            if let Some(secret) = state.totp.get_mut(&user_id) {
                secret.enabled = true;
                secret.enabled_utc = Some(Utc::now());
            }
            if let Some(identity) = state.identities.get_mut(&user_id) {
                identity.mfa_enabled = true;
            }
            state.backup_codes.insert(user_id, backup_hashes.to_vec());
            Ok(())
        })
    }

    async fn delete_totp(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.with_state(|state| {
            state.totp.remove(&user_id);
            state.backup_codes.remove(&user_id);
            if let Some(identity) = state.identities.get_mut(&user_id) {
                identity.mfa_enabled = false;
            }
            Ok(())
        })
    }

    async fn backup_code_hashes(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError> {
        self.with_state(|state| Ok(state.backup_codes.get(&user_id).cloned().unwrap_or_default()))
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        hashes: &[String],
    ) -> Result<(), ServiceError> {
        self.with_state(|state| {
            state.backup_codes.insert(user_id, hashes.to_vec());
            Ok(())
        })
    }

    async fn consume_backup_code(&self, user_id: Uuid, hash: &str) -> Result<bool, ServiceError> {
        self.with_state(|state| {
            let Some(codes) = state.backup_codes.get_mut(&user_id) else {
                return Ok(false);
            };
            match codes.iter().position(|c| c == hash) {
                Some(index) => {
                    codes.swap_remove(index);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    async fn update_password_hash(&self, user_id: Uuid, hash: &str) -> Result<(), ServiceError> {
        self.with_state(|state| {
            if let Some(identity) = state.identities.get_mut(&user_id).filter(|i| live(i)) {
                identity.password_hash = Some(hash.to_string());
            }
            Ok(())
        })
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}
