/**
 * Rate Limiter
 *
 * Atomic sliding-window counter over Redis sorted sets, identity-scoped
 * (ip / user / session). All mutation goes through a single Lua script so
 * concurrent checks never read-modify-write from application code.
 *
 * A request may be decorated with several windows at once (e.g. "30/day
 * AND 5/min"); the script admits all of them or none. On rejection the
 * caller receives `RATE_LIMIT` with the offending limit and the seconds
 * until the earliest entry expires.
 */

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

/// Sliding-window sorted-set limiter.
///
/// KEYS: one sorted set per window. ARGV: `now`, then `(limit, window,
/// nonce)` per key. Pass one: drop expired entries and bail out with
/// `{key, limit, reset}` on the first saturated window, inserting
/// nothing. Pass two: record the nonce in every window and refresh TTLs.
const CHECK_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
for i, key in ipairs(KEYS) do
    local limit = tonumber(ARGV[3 * i - 1])
    local window = tonumber(ARGV[3 * i])
    redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
    if redis.call('ZCARD', key) >= limit then
        local reset = window
        local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        if oldest[2] then
            reset = math.ceil(tonumber(oldest[2]) + window - now)
        end
        return {key, limit, reset}
    end
end
for i, key in ipairs(KEYS) do
    local window = tonumber(ARGV[3 * i])
    redis.call('ZADD', key, now, ARGV[3 * i + 1])
    redis.call('EXPIRE', key, window)
end
return nil
"#;

/// What identity a limit is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Ip,
    User,
    Session,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Session => "session",
        }
    }
}

/// One admission window: at most `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub limit: i64,
    pub window_secs: i64,
}

impl Window {
    pub const fn per_minute(limit: i64) -> Self {
        Self {
            limit,
            window_secs: 60,
        }
    }

    pub const fn per_hour(limit: i64) -> Self {
        Self {
            limit,
            window_secs: 3600,
        }
    }

    pub const fn per_day(limit: i64) -> Self {
        Self {
            limit,
            window_secs: 86_400,
        }
    }
}

/// Login attempts: 30 per day and 5 per minute, per client address.
pub const LOGIN_WINDOWS: [Window; 2] = [Window::per_day(30), Window::per_minute(5)];

#[derive(Clone)]
pub struct RateLimiter {
    redis: ConnectionManager,
    script: Arc<Script>,
}

impl RateLimiter {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: Arc::new(Script::new(CHECK_SCRIPT)),
        }
    }

    /// Admit or reject one request identified by `(scope, identity, op)`
    /// against every window at once.
    ///
    /// # Errors
    ///
    /// Returns `RATE_LIMIT` with `{limit, reset}` when any window is
    /// saturated; no window is charged in that case.
    pub async fn check(
        &self,
        scope: Scope,
        identity: &str,
        op: &str,
        windows: &[Window],
    ) -> Result<(), ApiError> {
        if windows.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let nonce = uuid::Uuid::new_v4().simple().to_string();

        let mut invocation = self.script.prepare_invoke();
        invocation.arg(now);
        for w in windows {
            invocation
                .key(limit_key(scope, identity, op, w.window_secs))
                .arg(w.limit)
                .arg(w.window_secs)
                .arg(&nonce);
        }

        let mut conn = self.redis.clone();
        let rejected: Option<(String, i64, i64)> = invocation.invoke_async(&mut conn).await?;

        match rejected {
            None => Ok(()),
            Some((key, limit, reset)) => {
                tracing::debug!(key, limit, reset, "[RateLimit] Rejected request");
                Err(ApiError::with_data(
                    ErrorCode::RateLimit,
                    json!({ "limit": limit, "reset": reset }),
                ))
            }
        }
    }
}

fn limit_key(scope: Scope, identity: &str, op: &str, window_secs: i64) -> String {
    format!("{}:{}:{}:{}", scope.as_str(), identity, op, window_secs)
}

/// Middleware guarding the login/refresh surface per client address.
pub async fn login_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = client_ip(&request, addr);
    state
        .limiter
        .check(Scope::Ip, &identity, "login", &LOGIN_WINDOWS)
        .await?;
    Ok(next.run(request).await)
}

/// Prefer the first X-Forwarded-For hop when a proxy fronts us.
fn client_ip(request: &Request, addr: SocketAddr) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_key_shape() {
        assert_eq!(
            limit_key(Scope::Ip, "10.0.0.1", "login", 60),
            "ip:10.0.0.1:login:60"
        );
        assert_eq!(
            limit_key(Scope::Session, "991", "send", 86_400),
            "session:991:send:86400"
        );
    }

    #[test]
    fn test_window_presets() {
        assert_eq!(Window::per_minute(5).window_secs, 60);
        assert_eq!(Window::per_day(30).window_secs, 86_400);
        assert_eq!(LOGIN_WINDOWS[0].limit, 30);
        assert_eq!(LOGIN_WINDOWS[1].limit, 5);
    }
}
