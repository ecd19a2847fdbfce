/**
 * Push Stream
 *
 * Durable, capped stream of notification payloads feeding the web-push
 * workers, plus the short-lived per-user pending hold used while a
 * recipient is (or was until moments ago) connected.
 */

use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use serde_json::Value;

use crate::error::ApiError;

pub const STREAM_KEY: &str = "webpush_stream";
pub const GROUP_NAME: &str = "webpush_group";

/// FIFO trim bound of the stream.
const STREAM_MAXLEN: usize = 50_000;
/// How long a pending hold survives without the user reconnecting.
const PENDING_TTL_SECS: i64 = 3600;

/// Append one `(user_id, payload)` entry, trimming the stream to its cap.
pub async fn append(
    conn: &mut ConnectionManager,
    user_id: i64,
    payload: &Value,
) -> Result<(), ApiError> {
    let encoded = payload.to_string();
    conn.xadd_maxlen::<_, _, _, _, ()>(
        STREAM_KEY,
        StreamMaxlen::Approx(STREAM_MAXLEN),
        "*",
        &[("user_id", user_id.to_string()), ("payload", encoded)],
    )
    .await?;
    Ok(())
}

/// Create the consumer group if it does not exist yet. A BUSYGROUP reply
/// means another worker won the race and is not an error.
pub async fn ensure_group(conn: &mut ConnectionManager) -> Result<(), ApiError> {
    match conn
        .xgroup_create_mkstream::<_, _, _, ()>(STREAM_KEY, GROUP_NAME, "$")
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Park a payload for an online user in case they disconnect soon.
pub async fn hold_pending(
    conn: &mut ConnectionManager,
    user_id: i64,
    payload: &str,
) -> Result<(), ApiError> {
    let key = pending_key(user_id);
    let _: () = redis::pipe()
        .lpush(&key, payload)
        .ignore()
        .expire(&key, PENDING_TTL_SECS)
        .ignore()
        .query_async(conn)
        .await?;
    Ok(())
}

/// Drop held entries; the user reconnected and receives events in-band.
pub async fn clear_pending(conn: &mut ConnectionManager, user_id: i64) -> Result<(), ApiError> {
    conn.del::<_, ()>(pending_key(user_id)).await?;
    Ok(())
}

/// Re-enqueue every held entry onto the main stream so it goes out via
/// web push. Called when the user's last connection closes.
pub async fn flush_pending(conn: &mut ConnectionManager, user_id: i64) -> Result<(), ApiError> {
    let key = pending_key(user_id);
    loop {
        let held: Option<String> = conn.rpop(&key, None).await?;
        let Some(raw) = held else {
            return Ok(());
        };
        let payload: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(user_id, "[Push] Dropping undecodable pending entry: {e}");
                continue;
            }
        };
        append(conn, user_id, &payload).await?;
    }
}

fn pending_key(user_id: i64) -> String {
    format!("pending:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_key_shape() {
        assert_eq!(pending_key(13), "pending:13");
    }
}
