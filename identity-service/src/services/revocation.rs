use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ServiceError;
use super::metrics::{self, AuthEvent};
use super::redis::CacheStore;
use crate::config::StoreFailurePolicy;

/// Revoked entries outlive the token by this much so a token accepted under
/// verification leeway cannot slip past an expired blacklist entry.
const REVOCATION_GRACE_SECONDS: i64 = 60;

fn blacklist_key(jti: &str) -> String {
    format!("blacklist:{}", jti)
}

fn sessions_key(user_id: Uuid) -> String {
    format!("sessions:{}", user_id)
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after: u64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: 0,
        }
    }

    /// `Err(RateLimited)` when the limit was exceeded.
    pub fn into_result(self) -> Result<(), ServiceError> {
        if self.allowed {
            Ok(())
        } else {
            Err(ServiceError::RateLimited {
                retry_after: self.retry_after,
            })
        }
    }
}

/// Blacklist, per-user session index and counters on top of the shared
/// cache. Cache failures on the request path are resolved by the
/// configured [`StoreFailurePolicy`].
#[derive(Clone)]
pub struct RevocationStore {
    cache: Arc<dyn CacheStore>,
    policy: StoreFailurePolicy,
    session_ttl_seconds: u64,
}

impl RevocationStore {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        policy: StoreFailurePolicy,
        session_ttl_seconds: u64,
    ) -> Self {
        Self {
            cache,
            policy,
            session_ttl_seconds,
        }
    }

    pub fn policy(&self) -> StoreFailurePolicy {
        self.policy
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Apply the failure policy to a cache error. Fail-open yields `fallback`.
    fn on_store_error<T>(
        &self,
        op: &'static str,
        err: anyhow::Error,
        fallback: T,
    ) -> Result<T, ServiceError> {
        match self.policy {
            StoreFailurePolicy::FailOpen => {
                tracing::warn!(operation = op, error = %err, "Cache unreachable, failing open");
                metrics::record(AuthEvent::StoreFailOpen);
                Ok(fallback)
            }
            StoreFailurePolicy::FailClosed => {
                tracing::error!(operation = op, error = %err, "Cache unreachable, failing closed");
                Err(ServiceError::StoreUnavailable)
            }
        }
    }

    pub async fn is_revoked(&self, jti: &str) -> Result<bool, ServiceError> {
        match self.cache.exists(&blacklist_key(jti)).await {
            Ok(revoked) => Ok(revoked),
            Err(e) => self.on_store_error("is_revoked", e, false),
        }
    }

    /// Blacklist `jti` until shortly after `exp`.
    pub async fn revoke(&self, jti: &str, exp: i64) -> Result<(), anyhow::Error> {
        self.cache
            .set_ex(&blacklist_key(jti), "revoked", ttl_until(exp))
            .await
    }

    /// Revoke `jti` unless it already is. `Ok(true)` means this caller won
    /// the claim; `Ok(false)` means someone else revoked it first.
    pub async fn claim(&self, jti: &str, exp: i64) -> Result<bool, ServiceError> {
        match self
            .cache
            .set_nx_ex(&blacklist_key(jti), "rotated", ttl_until(exp))
            .await
        {
            Ok(claimed) => Ok(claimed),
            Err(e) => self.on_store_error("claim", e, true),
        }
    }

    /// Count a hit against `key` and report whether it stays within `limit`.
    pub async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<RateDecision, ServiceError> {
        match self.cache.incr_with_expiry(key, window_seconds).await {
            Ok(window) if window.count > limit => {
                metrics::record(AuthEvent::RateLimited);
                tracing::warn!(key = %key, count = window.count, limit, "Rate limit exceeded");
                Ok(RateDecision {
                    allowed: false,
                    retry_after: window.ttl_seconds,
                })
            }
            Ok(_) => Ok(RateDecision::allow()),
            Err(e) => self.on_store_error("rate_limit", e, RateDecision::allow()),
        }
    }

    /// Clear a counter, e.g. after a successful attempt. Best effort.
    pub async fn reset_counter(&self, key: &str) {
        if let Err(e) = self.cache.del(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to reset counter");
        }
    }

    /// Take a short-lived exclusive hold on `key`. `Ok(false)` means another
    /// request already holds it.
    pub async fn acquire(&self, key: &str, ttl_seconds: u64) -> Result<bool, ServiceError> {
        match self.cache.set_nx_ex(key, "held", ttl_seconds).await {
            Ok(acquired) => Ok(acquired),
            Err(e) => self.on_store_error("acquire", e, true),
        }
    }

    pub async fn release(&self, key: &str) {
        if let Err(e) = self.cache.del(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to release hold");
        }
    }

    /// Record an issued jti in the user's session index, scored by expiry.
    /// Entries past their expiry are trimmed on the way. Best effort: a
    /// missing entry only weakens revoke-all for that one token.
    pub async fn track_session(&self, user_id: Uuid, jti: &str, exp: i64) {
        let floor = Utc::now().timestamp() - REVOCATION_GRACE_SECONDS;
        if let Err(e) = self
            .cache
            .zadd_trim(&sessions_key(user_id), jti, exp, floor, self.session_ttl_seconds)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to index session");
        }
    }

    /// Drop a jti that no longer needs revoke-all coverage because it has
    /// already been rotated or revoked.
    pub async fn untrack_session(&self, user_id: Uuid, jti: &str) {
        if let Err(e) = self.cache.zrem(&sessions_key(user_id), jti).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to drop session from index");
        }
    }

    /// Revoke every live jti in the user's session index and clear it.
    /// Returns how many entries were revoked.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<usize, anyhow::Error> {
        let key = sessions_key(user_id);
        let floor = Utc::now().timestamp() - REVOCATION_GRACE_SECONDS;
        let members = self.cache.zrange_from(&key, floor).await?;
        let revoked = members.len();

        for (jti, exp) in members {
            self.revoke(&jti, exp).await?;
        }

        self.cache.del(&key).await?;
        tracing::info!(user_id = %user_id, revoked, "Revoked all sessions");
        Ok(revoked)
    }

    /// Live entries in the user's session index.
    pub async fn indexed_sessions(&self, user_id: Uuid) -> Result<usize, anyhow::Error> {
        let floor = Utc::now().timestamp() - REVOCATION_GRACE_SECONDS;
        Ok(self.cache.zrange_from(&sessions_key(user_id), floor).await?.len())
    }

    pub async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.cache.health_check().await
    }
}

fn ttl_until(exp: i64) -> u64 {
    let remaining = exp - Utc::now().timestamp();
    (remaining.max(0) + REVOCATION_GRACE_SECONDS) as u64
}
