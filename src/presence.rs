/**
 * Presence Tracker
 *
 * Shared mapping from user to active session IDs with per-session
 * last-active TTLs, kept in Redis:
 *
 * - `session:{sid}:last_active` -> floating Unix timestamp, TTL 60 s
 * - `user:{uid}:sessions` -> set of session IDs, TTL 3600 s
 *
 * A user is online iff any session in their set has a last-active within
 * 120 s. Stale session IDs (whose last-active key expired) are pruned
 * lazily on inspection; the system never claims online on the strength of
 * a stale set entry alone.
 *
 * Writes are pipelined; readers accept a brief inconsistency window.
 */

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::ApiError;

/// TTL of the per-session last-active key.
const LAST_ACTIVE_TTL_SECS: u64 = 60;
/// TTL of the per-user session set, refreshed on activity.
const USER_SET_TTL_SECS: i64 = 3600;
/// How recent a last-active must be for the user to count as online.
pub const ONLINE_WINDOW_SECS: f64 = 120.0;

/// Shared presence state backed by the KV tier.
#[derive(Clone)]
pub struct PresenceTracker {
    redis: ConnectionManager,
}

impl PresenceTracker {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Record activity for `(user, session)`: refresh the session's
    /// last-active stamp and its membership in the user's set.
    pub async fn mark_online(&self, user_id: i64, session_id: i64) -> Result<(), ApiError> {
        let now = unix_now();
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .set_ex(last_active_key(session_id), now, LAST_ACTIVE_TTL_SECS)
            .ignore()
            .sadd(sessions_key(user_id), session_id)
            .ignore()
            .expire(sessions_key(user_id), USER_SET_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove `(user, session)` from presence: drop the last-active stamp
    /// and the set membership.
    pub async fn mark_offline(&self, user_id: i64, session_id: i64) -> Result<(), ApiError> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .del(last_active_key(session_id))
            .ignore()
            .srem(sessions_key(user_id), session_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Is any session of `user_id` active within the online window?
    ///
    /// Session IDs whose last-active key has expired are removed from the
    /// set as a side effect (tombstone cleanup).
    pub async fn is_online(&self, user_id: i64) -> Result<bool, ApiError> {
        let mut conn = self.redis.clone();
        let sessions: Vec<i64> = conn.smembers(sessions_key(user_id)).await?;
        if sessions.is_empty() {
            return Ok(false);
        }

        let keys: Vec<String> = sessions.iter().map(|sid| last_active_key(*sid)).collect();
        let stamps: Vec<Option<f64>> = conn.mget(&keys).await?;

        let now = unix_now();
        let mut online = false;
        let mut stale: Vec<i64> = Vec::new();
        for (sid, stamp) in sessions.iter().zip(stamps.iter()) {
            match stamp {
                Some(last_active) if now - last_active <= ONLINE_WINDOW_SECS => online = true,
                Some(_) => {}
                None => stale.push(*sid),
            }
        }

        if !stale.is_empty() {
            if let Err(e) = conn.srem::<_, _, ()>(sessions_key(user_id), &stale).await {
                tracing::debug!(user_id, "Stale presence cleanup failed: {e}");
            }
        }
        Ok(online)
    }
}

fn last_active_key(session_id: i64) -> String {
    format!("session:{session_id}:last_active")
}

fn sessions_key(user_id: i64) -> String {
    format!("user:{user_id}:sessions")
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(last_active_key(7), "session:7:last_active");
        assert_eq!(sessions_key(42), "user:42:sessions");
    }

    #[test]
    fn test_unix_now_is_sane() {
        // After 2024 service epoch, before year ~2100.
        let now = unix_now();
        assert!(now > 1_725_494_400.0);
        assert!(now < 4_102_444_800.0);
    }
}
