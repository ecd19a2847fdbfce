/**
 * Notification Model
 *
 * The payload that travels end-to-end: persisted as a row, published on
 * the bus for live connections, and appended to the push stream for
 * offline fan-out. `loaded` carries a pre-resolved view of the linked
 * entity so receivers never re-fetch it.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::snowflake::SnowflakeGenerator;

/// Longest `message` preview carried in a payload.
pub const MESSAGE_PREVIEW_LEN: usize = 100;

/// What happened, from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewComment,
    Followed,
    ModDeletedComment,
    ModDeletedPost,
}

/// One notification, as stored and as published.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    /// Notification ID (snowflake)
    pub id: i64,
    /// Acting user
    pub from_id: i64,
    /// Recipient
    pub to_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Truncated preview of the triggering content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second_linked_id: Option<i64>,
    /// Pre-resolved view of the linked entity; suppresses re-fetching
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded: Option<Value>,
}

/// Fields the caller supplies when raising a notification.
#[derive(Debug, Clone, Default)]
pub struct NotificationInput {
    pub message: Option<String>,
    pub linked_type: Option<String>,
    pub linked_id: Option<i64>,
    pub second_linked_id: Option<i64>,
    pub loaded: Option<Value>,
}

/// Trim a message preview to `MESSAGE_PREVIEW_LEN` characters, appending
/// an ellipsis when anything was cut. Operates on characters, not bytes.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MESSAGE_PREVIEW_LEN {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MESSAGE_PREVIEW_LEN).collect();
    out.push('…');
    out
}

/// Persist a notification row and return the full payload.
pub async fn create(
    pool: &PgPool,
    ids: &SnowflakeGenerator,
    from_id: i64,
    to_id: i64,
    kind: NotificationKind,
    input: NotificationInput,
) -> Result<Notification, sqlx::Error> {
    let id = ids.generate();
    let message = input.message.as_deref().map(truncate_message);

    sqlx::query(
        r#"
        INSERT INTO notifications
            (id, from_id, to_id, kind, message, linked_type, linked_id, second_linked_id, created_at, is_read)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
        "#,
    )
    .bind(id)
    .bind(from_id)
    .bind(to_id)
    .bind(kind_column(kind))
    .bind(&message)
    .bind(&input.linked_type)
    .bind(input.linked_id)
    .bind(input.second_linked_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(Notification {
        id,
        from_id,
        to_id,
        kind,
        message,
        linked_type: input.linked_type,
        linked_id: input.linked_id,
        second_linked_id: input.second_linked_id,
        loaded: input.loaded,
    })
}

/// Mark a notification read. Idempotent: re-marking an already-read row
/// is a no-op.
pub async fn mark_read(pool: &PgPool, to_id: i64, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE notifications SET is_read = TRUE WHERE id = $1 AND to_id = $2
        "#,
    )
    .bind(id)
    .bind(to_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn kind_column(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::NewComment => "new_comment",
        NotificationKind::Followed => "followed",
        NotificationKind::ModDeletedComment => "mod_deleted_comment",
        NotificationKind::ModDeletedPost => "mod_deleted_post",
    }
}

impl sqlx::Type<sqlx::Postgres> for NotificationKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for NotificationKind {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let raw = <String as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match raw.as_str() {
            "new_comment" => Ok(NotificationKind::NewComment),
            "followed" => Ok(NotificationKind::Followed),
            "mod_deleted_comment" => Ok(NotificationKind::ModDeletedComment),
            "mod_deleted_post" => Ok(NotificationKind::ModDeletedPost),
            other => Err(format!("unknown notification kind: {other}").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_truncate_short_message_untouched() {
        assert_eq!(truncate_message("hello"), "hello");
    }

    #[test]
    fn test_truncate_long_message() {
        let long = "x".repeat(250);
        let out = truncate_message(&long);
        assert_eq!(out.chars().count(), MESSAGE_PREVIEW_LEN + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        let long: String = "é".repeat(150);
        let out = truncate_message(&long);
        assert_eq!(out.chars().count(), MESSAGE_PREVIEW_LEN + 1);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&NotificationKind::ModDeletedPost).unwrap();
        assert_eq!(json, "\"mod_deleted_post\"");
    }

    #[test]
    fn test_payload_omits_empty_fields() {
        let n = Notification {
            id: 1,
            from_id: 2,
            to_id: 3,
            kind: NotificationKind::Followed,
            message: None,
            linked_type: None,
            linked_id: None,
            second_linked_id: None,
            loaded: None,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert!(json.get("message").is_none());
        assert!(json.get("loaded").is_none());
        assert_eq!(json["type"], "followed");
    }
}
