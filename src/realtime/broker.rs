/**
 * Pub/Sub Broker Bridge
 *
 * Per-connection subscriber on the shared bus. Callbacks are registered
 * against patterns; a single drain loop decodes each incoming message as
 * JSON and hands it to the matching callback. A callback returning
 * `false` unsubscribes its pattern. Decode failures are logged and never
 * terminate the drain loop. Dropping the bridge drops its dedicated
 * connection, which is the teardown path when the owning task is
 * cancelled.
 */

use futures_util::StreamExt;
use redis::aio::PubSub;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ApiError;

/// Handler for one pattern. Returns `false` to drop the subscription.
pub type BrokerCallback = Box<dyn FnMut(&str, Value) -> bool + Send>;

pub struct BrokerBridge {
    pubsub: PubSub,
    callbacks: HashMap<String, BrokerCallback>,
}

impl BrokerBridge {
    /// Establish a dedicated subscriber connection on the bus.
    pub async fn connect(client: &redis::Client) -> Result<Self, ApiError> {
        let pubsub = client.get_async_pubsub().await?;
        Ok(Self {
            pubsub,
            callbacks: HashMap::new(),
        })
    }

    /// Register `callback` for `pattern` and issue the psubscribe.
    pub async fn subscribe(
        &mut self,
        pattern: &str,
        callback: BrokerCallback,
    ) -> Result<(), ApiError> {
        self.pubsub.psubscribe(pattern).await?;
        self.callbacks.insert(pattern.to_string(), callback);
        Ok(())
    }

    /// Drain the bus until every subscription is gone or the task is
    /// cancelled. Intended to run as one task of the connection's group.
    pub async fn start(&mut self) {
        loop {
            if self.callbacks.is_empty() {
                return;
            }

            let received = {
                let mut stream = self.pubsub.on_message();
                stream.next().await
            };
            let Some(msg) = received else {
                tracing::debug!("[Broker] Bus stream ended");
                return;
            };

            let pattern: String = match msg.get_pattern() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("[Broker] Message without pattern: {e}");
                    continue;
                }
            };
            let channel = msg.get_channel_name().to_string();
            let payload: Value = match msg
                .get_payload::<String>()
                .map_err(ApiError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| ApiError::internal(e)))
            {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(channel, "[Broker] Undecodable payload dropped");
                    continue;
                }
            };

            let keep = match self.callbacks.get_mut(&pattern) {
                Some(callback) => callback(&channel, payload),
                None => {
                    tracing::debug!(pattern, "[Broker] No callback for pattern");
                    continue;
                }
            };

            if !keep {
                self.callbacks.remove(&pattern);
                if let Err(e) = self.pubsub.punsubscribe(&pattern).await {
                    tracing::warn!(pattern, "[Broker] Unsubscribe failed: {e}");
                }
            }
        }
    }
}
