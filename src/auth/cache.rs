/**
 * Auth Cache
 *
 * Multi-tier lookaside that short-circuits repeated token validations:
 *
 * - **L1** — request-scoped map, discarded when the request ends.
 * - **L2** — worker-local TTL map, swept every 15 s and bounded to 5,000
 *   entries.
 * - **L3** — shared Redis keys (JSON values), authoritative across workers.
 *
 * On a full miss the credential store is consulted and every tier is
 * populated with TTL = min(remaining token lifetime, 60 s). Logout purges
 * the single key from all tiers; password change with session closure
 * purges `auth:{user}:*` by pattern scan.
 *
 * All three tiers degrade safely to a database fetch.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::store;
use crate::auth::token::{decode_token, DecodedToken};
use crate::error::{ApiError, ErrorCode};

/// Hard cap on cache entry TTL, seconds.
const MAX_CACHE_TTL_SECS: i64 = 60;
/// L2 sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// L2 entry bound; the sweep trims the soonest-expiring tail beyond this.
const L2_MAX_ENTRIES: usize = 5_000;

/// A validated token: the credential row facts a request needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckedToken {
    pub user_id: i64,
    pub session_id: i64,
    pub secret: String,
    /// Token expiration, Unix seconds
    pub expiration: i64,
}

/// L1: request-scoped validation cache. Create one per request (or per
/// connection frame batch) and drop it when done.
#[derive(Debug, Default)]
pub struct RequestCache {
    entries: HashMap<String, CheckedToken>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// L2: worker-local TTL map. Kept separate from `AuthCache` so the eviction
/// logic is testable on its own.
#[derive(Debug, Default)]
pub struct TtlMap {
    entries: HashMap<String, TtlEntry>,
}

#[derive(Debug, Clone)]
struct TtlEntry {
    value: CheckedToken,
    expires_at: Instant,
}

impl TtlMap {
    pub fn get(&self, key: &str) -> Option<CheckedToken> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: CheckedToken, ttl: Duration) {
        self.entries.insert(
            key,
            TtlEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn remove_by_prefix(&mut self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop expired entries, then trim the soonest-expiring tail down to
    /// `max_entries`.
    pub fn sweep(&mut self, max_entries: usize) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);

        if self.entries.len() > max_entries {
            let mut by_expiry: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.expires_at))
                .collect();
            by_expiry.sort_by_key(|(_, exp)| *exp);
            let excess = self.entries.len() - max_entries;
            for (key, _) in by_expiry.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }
    }
}

/// The three-tier auth cache. One per worker process.
pub struct AuthCache {
    l2: RwLock<TtlMap>,
    redis: ConnectionManager,
    pool: PgPool,
    access_token_key: String,
    signing_key: String,
}

impl AuthCache {
    pub fn new(
        redis: ConnectionManager,
        pool: PgPool,
        access_token_key: String,
        signing_key: String,
    ) -> Self {
        Self {
            l2: RwLock::new(TtlMap::default()),
            redis,
            pool,
            access_token_key,
            signing_key,
        }
    }

    /// Validate an access token, probing L1 -> L2 -> L3 -> credential store.
    ///
    /// # Errors
    ///
    /// Fails fast with the codec's typed error on a malformed token, with
    /// `EXPIRED_TOKEN` on a stale one, and with `INVALID_TOKEN` when no
    /// credential row backs the secret.
    pub async fn check_token(
        &self,
        l1: &mut RequestCache,
        token: &str,
    ) -> Result<CheckedToken, ApiError> {
        let decoded = decode_token(token, &self.access_token_key, &self.signing_key)?;
        if decoded.is_expired {
            return Err(ApiError::new(ErrorCode::ExpiredToken));
        }

        let key = cache_key(decoded.user_id, &decoded.secret);

        if let Some(hit) = l1.entries.get(&key) {
            return Ok(hit.clone());
        }
        if let Some(hit) = self.l2.read().await.get(&key) {
            l1.entries.insert(key, hit.clone());
            return Ok(hit);
        }
        if let Some(hit) = self.probe_shared(&key).await {
            let ttl = cache_ttl(decoded.expiration);
            self.l2.write().await.insert(key.clone(), hit.clone(), ttl);
            l1.entries.insert(key, hit.clone());
            return Ok(hit);
        }

        let checked = self.validate_against_store(&decoded).await?;
        self.populate(l1, key, &checked, cache_ttl(decoded.expiration))
            .await;
        Ok(checked)
    }

    /// Validate a token against the credential store, bypassing every cache
    /// tier. Used by connections handling `check_token` session events.
    pub async fn check_token_uncached(&self, token: &str) -> Result<CheckedToken, ApiError> {
        let decoded = decode_token(token, &self.access_token_key, &self.signing_key)?;
        if decoded.is_expired {
            return Err(ApiError::new(ErrorCode::ExpiredToken));
        }
        self.validate_against_store(&decoded).await
    }

    /// Purge one credential from every tier (logout).
    pub async fn purge(&self, user_id: i64, secret: &str) {
        let key = cache_key(user_id, secret);
        self.l2.write().await.remove(&key);
        let mut conn = self.redis.clone();
        if let Err(e) = conn.del::<_, ()>(&key).await {
            tracing::warn!(key, "Failed to purge shared auth cache: {e}");
        }
    }

    /// Purge every credential of a user from every tier, by pattern scan
    /// (password change with session closure).
    pub async fn purge_user(&self, user_id: i64) {
        let prefix = format!("auth:{user_id}:");
        self.l2.write().await.remove_by_prefix(&prefix);

        let pattern = format!("{prefix}*");
        let mut conn = self.redis.clone();
        let keys: Vec<String> = {
            let mut iter = match conn.scan_match::<_, String>(&pattern).await {
                Ok(iter) => iter,
                Err(e) => {
                    tracing::warn!(pattern, "Failed to scan shared auth cache: {e}");
                    return;
                }
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if !keys.is_empty() {
            if let Err(e) = conn.del::<_, ()>(keys).await {
                tracing::warn!(user_id, "Failed to purge shared auth cache: {e}");
            }
        }
    }

    /// Background L2 sweep: every 15 s remove expired entries and trim to
    /// the entry bound.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let mut l2 = cache.l2.write().await;
                let before = l2.len();
                l2.sweep(L2_MAX_ENTRIES);
                let after = l2.len();
                drop(l2);
                if before != after {
                    tracing::debug!(evicted = before - after, "Auth cache sweep");
                }
            }
        })
    }

    async fn probe_shared(&self, key: &str) -> Option<CheckedToken> {
        let mut conn = self.redis.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                // L3 outage degrades to a store fetch.
                tracing::warn!(key, "Shared auth cache read failed: {e}");
                None
            }
        }
    }

    async fn validate_against_store(
        &self,
        decoded: &DecodedToken,
    ) -> Result<CheckedToken, ApiError> {
        let row = store::lookup(&self.pool, decoded.user_id, &decoded.secret)
            .await?
            .ok_or_else(|| ApiError::new(ErrorCode::InvalidToken))?;
        Ok(CheckedToken {
            user_id: row.user_id,
            session_id: row.session_id,
            secret: row.token_secret,
            expiration: decoded.expiration,
        })
    }

    async fn populate(
        &self,
        l1: &mut RequestCache,
        key: String,
        checked: &CheckedToken,
        ttl: Duration,
    ) {
        let mut conn = self.redis.clone();
        if let Ok(raw) = serde_json::to_string(checked) {
            if let Err(e) = conn
                .set_ex::<_, _, ()>(&key, raw, ttl.as_secs().max(1))
                .await
            {
                tracing::warn!(key, "Shared auth cache write failed: {e}");
            }
        }
        self.l2.write().await.insert(key.clone(), checked.clone(), ttl);
        l1.entries.insert(key, checked.clone());
    }
}

fn cache_key(user_id: i64, secret: &str) -> String {
    format!("auth:{user_id}:{secret}")
}

fn cache_ttl(expiration: i64) -> Duration {
    let remaining = expiration - chrono::Utc::now().timestamp();
    Duration::from_secs(remaining.clamp(1, MAX_CACHE_TTL_SECS) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(user_id: i64) -> CheckedToken {
        CheckedToken {
            user_id,
            session_id: user_id * 10,
            secret: format!("secret-{user_id}"),
            expiration: chrono::Utc::now().timestamp() + 3600,
        }
    }

    #[tokio::test]
    async fn test_ttl_map_expires_entries() {
        tokio::time::pause();
        let mut map = TtlMap::default();
        map.insert("a".into(), checked(1), Duration::from_secs(10));
        assert!(map.get("a").is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(map.get("a").is_none());

        map.sweep(L2_MAX_ENTRIES);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn test_ttl_map_trims_to_bound() {
        tokio::time::pause();
        let mut map = TtlMap::default();
        for i in 0..20i64 {
            // Later entries expire later, so the trim drops the early ones.
            map.insert(
                format!("k{i}"),
                checked(i),
                Duration::from_secs(100 + i as u64),
            );
        }
        map.sweep(5);
        assert_eq!(map.len(), 5);
        assert!(map.get("k19").is_some());
        assert!(map.get("k0").is_none());
    }

    #[tokio::test]
    async fn test_ttl_map_prefix_removal() {
        let mut map = TtlMap::default();
        map.insert("auth:1:aa".into(), checked(1), Duration::from_secs(60));
        map.insert("auth:1:bb".into(), checked(1), Duration::from_secs(60));
        map.insert("auth:2:cc".into(), checked(2), Duration::from_secs(60));

        map.remove_by_prefix("auth:1:");
        assert_eq!(map.len(), 1);
        assert!(map.get("auth:2:cc").is_some());
    }

    #[test]
    fn test_cache_ttl_is_bounded() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(cache_ttl(now + 10_000), Duration::from_secs(60));
        let short = cache_ttl(now + 5);
        assert!(short <= Duration::from_secs(5));
        // Already-passed expirations clamp to the 1 s floor.
        assert_eq!(cache_ttl(now - 100), Duration::from_secs(1));
    }

    #[test]
    fn test_cache_key_shape() {
        assert_eq!(cache_key(42, "abc"), "auth:42:abc");
    }
}
