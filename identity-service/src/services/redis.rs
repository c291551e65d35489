use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Increment a counter and start its window on the first hit, in one round trip.
const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
return {count, ttl}
"#;

/// Counter state after an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub ttl_seconds: u64,
}

/// Key-value cache primitives used by revocation, rate limiting and the
/// single-use secrets. Every mutation is atomic on a single key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error>;
    /// `SET key value NX EX ttl`. Returns `true` when this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64)
        -> Result<bool, anyhow::Error>;
    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error>;
    /// Returns `true` when a key was actually removed by this call.
    async fn del(&self, key: &str) -> Result<bool, anyhow::Error>;
    async fn get_del(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    /// In one step: drop members scored below `min_score`, add `member` at
    /// `score`, and push the key's expiry out to `ttl_seconds`.
    async fn zadd_trim(
        &self,
        key: &str,
        member: &str,
        score: i64,
        min_score: i64,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error>;
    /// Returns `true` when the member was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, anyhow::Error>;
    /// Members scored at or above `min_score`, with their scores.
    async fn zrange_from(&self, key: &str, min_score: i64)
        -> Result<Vec<(String, i64)>, anyhow::Error>;
    async fn incr_with_expiry(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<WindowCount, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
    timeout: Duration,
    incr_script: Script,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects on its own
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!(timeout_ms = config.timeout_ms, "Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            timeout: Duration::from_millis(config.timeout_ms),
            incr_script: Script::new(INCR_WITH_EXPIRY),
        })
    }

    /// Bound a Redis round trip. Elapsed deadlines are reported like any
    /// other connection failure.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, anyhow::Error>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("Redis {} failed: {}", op, e)),
            Err(_) => Err(anyhow::anyhow!(
                "Redis {} timed out after {}ms",
                op,
                self.timeout.as_millis()
            )),
        }
    }
}

#[async_trait]
impl CacheStore for RedisService {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        self.bounded("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        self.bounded(
            "SET",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_seconds)
                .query_async(&mut conn),
        )
        .await
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = self
            .bounded(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_seconds)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        self.bounded("EXISTS", redis::cmd("EXISTS").arg(key).query_async(&mut conn))
            .await
    }

    async fn del(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .bounded("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        self.bounded("GETDEL", redis::cmd("GETDEL").arg(key).query_async(&mut conn))
            .await
    }

    async fn zadd_trim(
        &self,
        key: &str,
        member: &str,
        score: i64,
        min_score: i64,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        self.bounded(
            "ZADD",
            redis::pipe()
                .atomic()
                .cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(format!("({}", min_score))
                .ignore()
                .cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_seconds)
                .ignore()
                .query_async(&mut conn),
        )
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .bounded("ZREM", redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn zrange_from(
        &self,
        key: &str,
        min_score: i64,
    ) -> Result<Vec<(String, i64)>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let members: Vec<(String, f64)> = self
            .bounded(
                "ZRANGEBYSCORE",
                redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(min_score)
                    .arg("+inf")
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<WindowCount, anyhow::Error> {
        let mut conn = self.manager.clone();
        let (count, ttl): (u64, i64) = self
            .bounded(
                "INCR script",
                self.incr_script
                    .key(key)
                    .arg(window_seconds)
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(WindowCount {
            count,
            ttl_seconds: if ttl > 0 { ttl as u64 } else { window_seconds },
        })
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let _: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum MockValue {
    Str(String),
    Sorted(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct MockEntry {
    value: MockValue,
    expires_at: Option<Instant>,
}

impl MockEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Test double: an in-process cache with the same atomicity as Redis.
/// `set_available(false)` makes every call fail, which is how outages are
/// simulated. Not wired into the binary.
pub struct MockCache {
    entries: Mutex<HashMap<String, MockEntry>>,
    available: AtomicBool,
}

impl Default for MockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining lifetime of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key).filter(|e| e.is_live())?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, MockEntry>) -> Result<T, anyhow::Error>,
    ) -> Result<T, anyhow::Error> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Mock cache unavailable"));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock cache mutex poisoned: {}", e))?;
        entries.retain(|_, entry| entry.is_live());
        f(&mut entries)
    }
}

fn expiry(ttl_seconds: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(ttl_seconds))
}

#[async_trait]
impl CacheStore for MockCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            Some(MockValue::Str(v)) => Ok(Some(v.clone())),
            Some(MockValue::Sorted(_)) => Err(anyhow::anyhow!("WRONGTYPE")),
            None => Ok(None),
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), anyhow::Error> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                MockEntry {
                    value: MockValue::Str(value.to_string()),
                    expires_at: expiry(ttl_seconds),
                },
            );
            Ok(())
        })
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, anyhow::Error> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                MockEntry {
                    value: MockValue::Str(value.to_string()),
                    expires_at: expiry(ttl_seconds),
                },
            );
            Ok(true)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, anyhow::Error> {
        self.with_entries(|entries| Ok(entries.contains_key(key)))
    }

    async fn del(&self, key: &str) -> Result<bool, anyhow::Error> {
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        self.with_entries(|entries| match entries.remove(key).map(|e| e.value) {
            Some(MockValue::Str(v)) => Ok(Some(v)),
            Some(MockValue::Sorted(_)) => Err(anyhow::anyhow!("WRONGTYPE")),
            None => Ok(None),
        })
    }

    async fn zadd_trim(
        &self,
        key: &str,
        member: &str,
        score: i64,
        min_score: i64,
        ttl_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| MockEntry {
                value: MockValue::Sorted(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                MockValue::Sorted(members) => {
                    members.retain(|_, s| *s >= min_score);
                    members.insert(member.to_string(), score);
                }
                MockValue::Str(_) => return Err(anyhow::anyhow!("WRONGTYPE")),
            }
            entry.expires_at = expiry(ttl_seconds);
            Ok(())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, anyhow::Error> {
        self.with_entries(|entries| match entries.get_mut(key).map(|e| &mut e.value) {
            Some(MockValue::Sorted(members)) => Ok(members.remove(member).is_some()),
            Some(MockValue::Str(_)) => Err(anyhow::anyhow!("WRONGTYPE")),
            None => Ok(false),
        })
    }

    async fn zrange_from(
        &self,
        key: &str,
        min_score: i64,
    ) -> Result<Vec<(String, i64)>, anyhow::Error> {
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            Some(MockValue::Sorted(members)) => {
                let mut live: Vec<(String, i64)> = members
                    .iter()
                    .filter(|(_, s)| **s >= min_score)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                live.sort_by_key(|(_, s)| *s);
                Ok(live)
            }
            Some(MockValue::Str(_)) => Err(anyhow::anyhow!("WRONGTYPE")),
            None => Ok(Vec::new()),
        })
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<WindowCount, anyhow::Error> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| MockEntry {
                value: MockValue::Str("0".to_string()),
                expires_at: expiry(window_seconds),
            });
            let count = match &entry.value {
                MockValue::Str(v) => v
                    .parse::<u64>()
                    .map_err(|_| anyhow::anyhow!("value is not an integer"))?,
                MockValue::Sorted(_) => return Err(anyhow::anyhow!("WRONGTYPE")),
            } + 1;
            entry.value = MockValue::Str(count.to_string());

            let ttl_seconds = entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs().max(1))
                .unwrap_or(window_seconds);
            Ok(WindowCount { count, ttl_seconds })
        })
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.with_entries(|_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_only_first_wins() {
        let cache = MockCache::new();
        assert!(cache.set_nx_ex("blacklist:a", "revoked", 60).await.unwrap());
        assert!(!cache.set_nx_ex("blacklist:a", "revoked", 60).await.unwrap());
        assert!(cache.exists("blacklist:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_del_consumes() {
        let cache = MockCache::new();
        cache.set_ex("oauth:state:s", "{}", 600).await.unwrap();
        assert_eq!(cache.get_del("oauth:state:s").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(cache.get_del("oauth:state:s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_del_reports_removal() {
        let cache = MockCache::new();
        cache.set_ex("otp:u", "123456", 600).await.unwrap();
        assert!(cache.del("otp:u").await.unwrap());
        assert!(!cache.del("otp:u").await.unwrap());
    }

    #[tokio::test]
    async fn test_counter_starts_window_once() {
        let cache = MockCache::new();
        let first = cache.incr_with_expiry("ratelimit:ip:1", 60).await.unwrap();
        let second = cache.incr_with_expiry("ratelimit:ip:1", 60).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.ttl_seconds <= 60);
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let cache = MockCache::new();
        cache.set_ex("k", "v", 0).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sorted_set_trims_and_removes() {
        let cache = MockCache::new();
        cache.zadd_trim("sessions:u", "old", 10, 0, 100).await.unwrap();
        cache.zadd_trim("sessions:u", "mid", 50, 0, 100).await.unwrap();
        // Adding with a higher floor drops everything scored below it.
        cache.zadd_trim("sessions:u", "new", 90, 40, 100).await.unwrap();

        let members = cache.zrange_from("sessions:u", 0).await.unwrap();
        assert_eq!(
            members,
            vec![("mid".to_string(), 50), ("new".to_string(), 90)]
        );
        assert_eq!(cache.zrange_from("sessions:u", 60).await.unwrap().len(), 1);

        assert!(cache.zrem("sessions:u", "mid").await.unwrap());
        assert!(!cache.zrem("sessions:u", "mid").await.unwrap());
        assert!(cache.ttl("sessions:u").unwrap() > Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_unavailable_cache_errors() {
        let cache = MockCache::new();
        cache.set_available(false);
        assert!(cache.get("k").await.is_err());
        assert!(cache.health_check().await.is_err());
        cache.set_available(true);
        assert!(cache.health_check().await.is_ok());
    }
}
