/**
 * Credential Store
 *
 * Persistent mapping from (user, session) to the current rotating secret.
 * One row per authenticated device. Rows are created on login/registration/
 * refresh, rotated on every refresh, and removed on logout or revocation.
 *
 * # Invariant
 *
 * `(user_id, token_secret, session_id)` uniquely identifies a live
 * credential; validation requires all three to match the stored row. All
 * writes run inside transactions; readers tolerate read-committed
 * visibility.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::auth::token::generate_secret;
use crate::snowflake::SnowflakeGenerator;

/// A live credential row: one authenticated device session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CredentialRow {
    /// Session ID (snowflake)
    pub session_id: i64,
    /// Owning user ID (snowflake)
    pub user_id: i64,
    /// Rotating secret embedded in tokens for this session
    pub token_secret: String,
    /// Created at timestamp
    pub created_at: DateTime<Utc>,
}

/// Issue a new credential for `user_id`, returning the created row.
///
/// # Arguments
/// * `pool` - Database connection pool
/// * `ids` - Snowflake generator for the session ID
/// * `user_id` - Owning user
pub async fn issue(
    pool: &PgPool,
    ids: &SnowflakeGenerator,
    user_id: i64,
) -> Result<CredentialRow, sqlx::Error> {
    let session_id = ids.generate();
    let secret = generate_secret();

    let mut tx = pool.begin().await?;
    let row = sqlx::query_as::<_, CredentialRow>(
        r#"
        INSERT INTO sessions (session_id, user_id, token_secret, created_at)
        VALUES ($1, $2, $3, $4)
        RETURNING session_id, user_id, token_secret, created_at
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .bind(&secret)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::debug!(session_id, user_id, "Issued credential");
    Ok(row)
}

/// Rotate the secret of an existing session (refresh path).
///
/// A single UPDATE keyed by `session_id`; returns the new secret, or `None`
/// if the session no longer exists.
pub async fn rotate(pool: &PgPool, session_id: i64) -> Result<Option<String>, sqlx::Error> {
    let secret = generate_secret();

    let mut tx = pool.begin().await?;
    let updated = sqlx::query(
        r#"
        UPDATE sessions SET token_secret = $1 WHERE session_id = $2
        "#,
    )
    .bind(&secret)
    .bind(session_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    if updated.rows_affected() == 0 {
        return Ok(None);
    }
    tracing::debug!(session_id, "Rotated credential secret");
    Ok(Some(secret))
}

/// Look up the credential row matching `(user_id, secret)`.
///
/// The secret is unique per session, so this resolves the session a token
/// belongs to. Returns `None` when no live row matches.
pub async fn lookup(
    pool: &PgPool,
    user_id: i64,
    secret: &str,
) -> Result<Option<CredentialRow>, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT session_id, user_id, token_secret, created_at
        FROM sessions
        WHERE user_id = $1 AND token_secret = $2
        "#,
    )
    .bind(user_id)
    .bind(secret)
    .fetch_optional(pool)
    .await
}

/// Look up a credential requiring all three identifiers to match.
pub async fn lookup_session(
    pool: &PgPool,
    user_id: i64,
    secret: &str,
    session_id: i64,
) -> Result<Option<CredentialRow>, sqlx::Error> {
    sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT session_id, user_id, token_secret, created_at
        FROM sessions
        WHERE user_id = $1 AND token_secret = $2 AND session_id = $3
        "#,
    )
    .bind(user_id)
    .bind(secret)
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

/// Delete the credential matching `(user_id, secret)` (logout).
///
/// Returns the removed session ID, if a row matched.
pub async fn delete(
    pool: &PgPool,
    user_id: i64,
    secret: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let session_id: Option<i64> = sqlx::query_scalar(
        r#"
        DELETE FROM sessions
        WHERE user_id = $1 AND token_secret = $2
        RETURNING session_id
        "#,
    )
    .bind(user_id)
    .bind(secret)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    if let Some(sid) = session_id {
        tracing::debug!(session_id = sid, user_id, "Revoked credential");
    }
    Ok(session_id)
}

/// Delete every credential of `user_id` except `keep_session_id`.
///
/// Used on password change when the client requests session closure.
/// Returns the session IDs that were removed so callers can purge caches
/// and notify the affected connections.
pub async fn delete_all_except(
    pool: &PgPool,
    user_id: i64,
    keep_session_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let removed: Vec<i64> = sqlx::query_scalar(
        r#"
        DELETE FROM sessions
        WHERE user_id = $1 AND session_id <> $2
        RETURNING session_id
        "#,
    )
    .bind(user_id)
    .bind(keep_session_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;

    if !removed.is_empty() {
        tracing::info!(user_id, count = removed.len(), "Revoked all other sessions");
    }
    Ok(removed)
}
