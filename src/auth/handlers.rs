/**
 * Auth Handlers
 *
 * HTTP surface for session lifecycle: token refresh, logout, and
 * password change. Content CRUD lives elsewhere; these handlers exist
 * because every realtime connection hangs off the credentials they
 * manage.
 *
 * # Security
 *
 * - Refresh rotates the session secret, so both previous tokens die at
 *   the store even before their expiry.
 * - Logout and password change purge every auth-cache tier before
 *   notifying live connections.
 * - Password verification is constant-time and runs off the async
 *   executor.
 */

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::cache::{CheckedToken, RequestCache};
use crate::auth::store;
use crate::auth::token::{decode_email_token, decode_token, encode_token, ACCESS_TOKEN_TTL_SECS};
use crate::error::{ApiError, ApiResponse, ErrorCode};
use crate::realtime::protocol::SessionAction;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix expiry of the new access token
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct EmailConfirmRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangeRequest {
    pub old_password: String,
    pub new_password: String,
    /// Revoke every other session of the user
    #[serde(default)]
    pub close_sessions: bool,
}

/// Resolve the caller's credential from the `Authorization` header.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<CheckedToken, ApiError> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized))?;
    let mut l1 = RequestCache::new();
    state.auth_cache.check_token(&mut l1, token).await
}

/// POST /auth/refresh
///
/// Exchange a refresh token for a fresh access/refresh pair. The session
/// secret is rotated, so the presented pair stops validating against the
/// store immediately; other connections on the session are told to
/// re-check their token in-band.
///
/// # Errors
///
/// * `EXPIRED_TOKEN` - The refresh token itself is past its 30-day life
/// * `INVALID_TOKEN` - No live credential matches the token
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<ApiResponse<RefreshResponse>>, ApiError> {
    let decoded = decode_token(
        &request.refresh_token,
        &state.config.refresh_token_key,
        &state.config.signing_key,
    )?;
    if decoded.is_expired {
        return Err(ApiError::new(ErrorCode::ExpiredToken));
    }

    let row = store::lookup(&state.pool, decoded.user_id, &decoded.secret)
        .await?
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidToken))?;

    let new_secret = store::rotate(&state.pool, row.session_id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidToken))?;

    // The old secret is dead; drop it from every cache tier and make the
    // session's other connections re-validate.
    state.auth_cache.purge(row.user_id, &decoded.secret).await;
    state
        .manager
        .session_control(row.session_id, SessionAction::CheckToken);

    let access_token = encode_token(
        row.user_id,
        &new_secret,
        false,
        &state.config.access_token_key,
        &state.config.signing_key,
    );
    let refresh_token = encode_token(
        row.user_id,
        &new_secret,
        true,
        &state.config.refresh_token_key,
        &state.config.signing_key,
    );

    tracing::info!(user_id = row.user_id, session_id = row.session_id, "[Auth] Session refreshed");
    Ok(Json(ApiResponse::ok(RefreshResponse {
        access_token,
        refresh_token,
        expires_at: chrono::Utc::now().timestamp() + ACCESS_TOKEN_TTL_SECS,
    })))
}

/// POST /auth/logout
///
/// Revoke the caller's credential, purge it from the auth cache, and
/// close any live connection of the session.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let checked = authenticate(&state, &headers).await?;

    let removed = store::delete(&state.pool, checked.user_id, &checked.secret).await?;
    state.auth_cache.purge(checked.user_id, &checked.secret).await;

    if let Some(session_id) = removed {
        state
            .manager
            .session_control(session_id, SessionAction::SessionLogout);
        tracing::info!(user_id = checked.user_id, session_id, "[Auth] Logged out");
    }
    Ok(Json(ApiResponse::empty()))
}

/// POST /auth/password
///
/// Change the caller's password after verifying the old one. With
/// `close_sessions`, every other session of the user is revoked and its
/// connections are closed.
///
/// # Errors
///
/// * `INCORRECT_PASSWORD` - The old password does not verify
/// * `USER_DOES_NOT_EXIST` - The credential points at a deleted user
pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PasswordChangeRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let checked = authenticate(&state, &headers).await?;

    let stored: Option<String> =
        sqlx::query_scalar("SELECT password FROM users WHERE user_id = $1")
            .bind(checked.user_id)
            .fetch_optional(&state.pool)
            .await?;
    let stored = stored.ok_or_else(|| ApiError::new(ErrorCode::UserDoesNotExist))?;

    if !state
        .hasher
        .verify(request.old_password, stored)
        .await?
    {
        return Err(ApiError::new(ErrorCode::IncorrectPassword));
    }

    let new_hash = state.hasher.hash(request.new_password).await?;
    sqlx::query("UPDATE users SET password = $1 WHERE user_id = $2")
        .bind(&new_hash)
        .bind(checked.user_id)
        .execute(&state.pool)
        .await?;

    if request.close_sessions {
        let removed =
            store::delete_all_except(&state.pool, checked.user_id, checked.session_id).await?;
        state.auth_cache.purge_user(checked.user_id).await;
        for session_id in removed {
            state
                .manager
                .session_control(session_id, SessionAction::SessionLogout);
        }
    }

    tracing::info!(
        user_id = checked.user_id,
        closed_sessions = request.close_sessions,
        "[Auth] Password changed"
    );
    Ok(Json(ApiResponse::empty()))
}

/// POST /auth/confirm-email
///
/// Apply a pending email change vouched for by an emailed verification
/// token. Needs no session: the token itself is the credential.
///
/// # Errors
///
/// * `EXPIRED_TOKEN` - The confirmation window has passed
/// * `INVALID_TOKEN` - No user is waiting to confirm this address
pub async fn confirm_email(
    State(state): State<AppState>,
    Json(request): Json<EmailConfirmRequest>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let email = verify_email_token(&request.token, &state.config.email_token_key)?;

    let updated = sqlx::query(
        r#"
        UPDATE users
        SET email = pending_email, pending_email = NULL, pending_email_deadline = NULL
        WHERE pending_email = $1
        "#,
    )
    .bind(&email)
    .execute(&state.pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::new(ErrorCode::InvalidToken));
    }

    tracing::info!("[Auth] Email confirmed");
    Ok(Json(ApiResponse::empty()))
}

/// Check signature and expiry of an email-verification token, returning
/// the address it vouches for.
fn verify_email_token(token: &str, key: &str) -> Result<String, ApiError> {
    let (email, expiration) = decode_email_token(token, key)?;
    if expiration <= chrono::Utc::now().timestamp() {
        return Err(ApiError::new(ErrorCode::ExpiredToken));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::encode_email_token;
    use pretty_assertions::assert_eq;

    const KEY: &str = "email-test-key";

    #[test]
    fn test_verify_email_token_accepts_live_token() {
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = encode_email_token("new@example.com", exp, KEY);
        assert_eq!(verify_email_token(&token, KEY).unwrap(), "new@example.com");
    }

    #[test]
    fn test_verify_email_token_rejects_expired() {
        let exp = chrono::Utc::now().timestamp() - 1;
        let token = encode_email_token("new@example.com", exp, KEY);
        let err = verify_email_token(&token, KEY).unwrap_err();
        assert_eq!(err.code, ErrorCode::ExpiredToken);
    }

    #[test]
    fn test_verify_email_token_rejects_wrong_key() {
        let token = encode_email_token("new@example.com", i64::MAX, KEY);
        let err = verify_email_token(&token, "another-key").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSignature);
    }
}
