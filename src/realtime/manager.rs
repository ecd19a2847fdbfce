/**
 * Realtime Manager
 *
 * Per-worker singleton bridging the shared bus and local websocket
 * connections. Holds the registry of local send/session queues per user;
 * a single fan-in subscriber drains `events:*` and `session_events:*`
 * and copies each decoded payload into every queue registered under the
 * target user. Publishing is fire-and-forget on detached tasks.
 *
 * Notifications raised here are persisted, published for live
 * connections, and appended to the push stream for offline fan-out.
 */

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::notification::{self, Notification, NotificationInput, NotificationKind};
use crate::push;
use crate::realtime::protocol::{
    events_channel, session_channel, session_events_channel, ServerEvent, SessionAction,
    SessionEvent,
};
use crate::snowflake::SnowflakeGenerator;

/// Opaque handle identifying one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(u64);

pub struct RealtimeManager {
    redis: ConnectionManager,
    client: redis::Client,
    pool: PgPool,
    ids: Arc<SnowflakeGenerator>,
    send_queues: Mutex<HashMap<i64, HashMap<u64, mpsc::Sender<ServerEvent>>>>,
    session_queues: Mutex<HashMap<i64, HashMap<u64, mpsc::Sender<SessionEvent>>>>,
    next_handle: AtomicU64,
}

impl RealtimeManager {
    pub fn new(
        redis: ConnectionManager,
        client: redis::Client,
        pool: PgPool,
        ids: Arc<SnowflakeGenerator>,
    ) -> Self {
        Self {
            redis,
            client,
            pool,
            ids,
            send_queues: Mutex::new(HashMap::new()),
            session_queues: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register a local connection's queues under `user_id`.
    pub fn add_connection(
        &self,
        user_id: i64,
        send_q: mpsc::Sender<ServerEvent>,
        session_q: mpsc::Sender<SessionEvent>,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.send_queues)
            .entry(user_id)
            .or_default()
            .insert(handle.0, send_q);
        lock(&self.session_queues)
            .entry(user_id)
            .or_default()
            .insert(handle.0, session_q);
        tracing::debug!(user_id, handle = handle.0, "[Realtime] Connection added");
        handle
    }

    /// Drop a connection's queues, removing the user's entry when it was
    /// the last one.
    pub fn remove_connection(&self, user_id: i64, handle: ConnectionHandle) {
        remove_from(&mut lock(&self.send_queues), user_id, handle.0);
        remove_from(&mut lock(&self.session_queues), user_id, handle.0);
        tracing::debug!(user_id, handle = handle.0, "[Realtime] Connection removed");
    }

    /// Run the fan-in loop forever, reconnecting with backoff when the
    /// bus drops.
    pub async fn start(self: Arc<Self>) {
        let mut backoff_secs = 1u64;
        loop {
            match self.drain_bus().await {
                Ok(()) => backoff_secs = 1,
                Err(e) => {
                    tracing::error!("[Realtime] Fan-in loop failed: {e}");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(30);
        }
    }

    async fn drain_bus(&self) -> Result<(), ApiError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe("events:*").await?;
        pubsub.psubscribe("session_events:*").await?;
        tracing::info!("[Realtime] Fan-in subscriber attached");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let raw: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(channel, "[Realtime] Unreadable payload: {e}");
                    continue;
                }
            };
            self.dispatch(&channel, &raw);
        }
        Ok(())
    }

    /// Route one bus message into the local queues for its user.
    fn dispatch(&self, channel: &str, raw: &str) {
        if let Some(user_id) = strip_user_id(channel, "events:") {
            let Ok(event) = serde_json::from_str::<ServerEvent>(raw) else {
                tracing::warn!(channel, "[Realtime] Undecodable event dropped");
                return;
            };
            let queues = lock(&self.send_queues);
            if let Some(targets) = queues.get(&user_id) {
                for q in targets.values() {
                    if q.try_send(event.clone()).is_err() {
                        tracing::warn!(user_id, "[Realtime] Send queue full, event dropped");
                    }
                }
            }
        } else if let Some(user_id) = strip_user_id(channel, "session_events:") {
            let Ok(event) = serde_json::from_str::<SessionEvent>(raw) else {
                tracing::warn!(channel, "[Realtime] Undecodable session event dropped");
                return;
            };
            let queues = lock(&self.session_queues);
            if let Some(targets) = queues.get(&user_id) {
                for q in targets.values() {
                    if q.try_send(event.clone()).is_err() {
                        tracing::warn!(user_id, "[Realtime] Session queue full, event dropped");
                    }
                }
            }
        }
    }

    /// Publish a user-visible event. Fire-and-forget: runs on a detached
    /// task and swallows bus connection errors into the logger.
    pub fn publish_event(&self, user_id: i64, event: &str, data: Option<Value>) {
        let payload = ServerEvent::named(event, data);
        self.publish_raw(events_channel(user_id), payload);
    }

    /// Publish a session-control event to every session of `user_id`.
    pub fn session_event(&self, user_id: i64, action: SessionAction, data: Option<Value>) {
        let payload = SessionEvent { action, data };
        self.publish_raw(session_events_channel(user_id), payload);
    }

    /// Publish a session-control event to one session only.
    pub fn session_control(&self, session_id: i64, action: SessionAction) {
        let payload = SessionEvent { action, data: None };
        self.publish_raw(session_channel(session_id), payload);
    }

    fn publish_raw<T: serde::Serialize>(&self, channel: String, payload: T) {
        let encoded = match serde_json::to_string(&payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(channel, "[Realtime] Failed to encode payload: {e}");
                return;
            }
        };
        let mut conn = self.redis.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.publish::<_, _, ()>(&channel, encoded).await {
                tracing::warn!(channel, "[Realtime] Publish failed: {e}");
            }
        });
    }

    /// Raise a notification: persist the row, publish it for live
    /// connections, and append it to the push stream for offline fan-out.
    ///
    /// Self-notifications (`from_id == to_id`) are dropped silently.
    pub async fn publish_notification(
        &self,
        from_id: i64,
        to_id: i64,
        kind: NotificationKind,
        input: NotificationInput,
    ) -> Result<Option<Notification>, ApiError> {
        if from_id == to_id {
            return Ok(None);
        }

        let row = notification::create(&self.pool, &self.ids, from_id, to_id, kind, input).await?;
        let payload = serde_json::to_value(&row).map_err(|e| ApiError::internal(e))?;

        self.publish_event(to_id, "notification", Some(payload.clone()));

        let mut conn = self.redis.clone();
        push::stream::append(&mut conn, to_id, &payload).await?;

        Ok(Some(row))
    }
}

fn strip_user_id(channel: &str, prefix: &str) -> Option<i64> {
    channel.strip_prefix(prefix)?.parse().ok()
}

/// Recover the guard even if a writer panicked; the registries hold only
/// plain maps, so a poisoned state is still consistent.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_from<Q>(map: &mut HashMap<i64, HashMap<u64, Q>>, user_id: i64, handle: u64) {
    if let Some(queues) = map.get_mut(&user_id) {
        queues.remove(&handle);
        if queues.is_empty() {
            map.remove(&user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_user_id() {
        assert_eq!(strip_user_id("events:42", "events:"), Some(42));
        assert_eq!(strip_user_id("session_events:7", "session_events:"), Some(7));
        assert_eq!(strip_user_id("events:abc", "events:"), None);
        assert_eq!(strip_user_id("other:42", "events:"), None);
    }
}
