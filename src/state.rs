/**
 * Application State Management
 *
 * This module defines the application state structure and implements
 * the necessary `FromRef` traits for Axum state extraction.
 *
 * # Architecture
 *
 * The `AppState` struct serves as the central state container for the
 * server, holding:
 * - Database pool and shared KV connection
 * - The per-worker auth cache, realtime manager, and rate limiter
 * - The snowflake ID generator and password hasher
 * - Runtime configuration
 *
 * # Thread Safety
 *
 * Every field is cheap to clone: pools and connection managers are
 * handle types, singletons are behind `Arc`.
 */

use axum::extract::FromRef;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::cache::AuthCache;
use crate::auth::password::PasswordHasher;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::presence::PresenceTracker;
use crate::realtime::manager::RealtimeManager;
use crate::snowflake::SnowflakeGenerator;

/// Central application state shared by every handler and task.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub redis: ConnectionManager,
    /// Bare client used to open dedicated pub/sub connections.
    pub redis_client: redis::Client,
    pub auth_cache: Arc<AuthCache>,
    pub manager: Arc<RealtimeManager>,
    pub presence: PresenceTracker,
    pub limiter: RateLimiter,
    pub hasher: PasswordHasher,
    pub ids: Arc<SnowflakeGenerator>,
    pub config: Arc<Config>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for ConnectionManager {
    fn from_ref(state: &AppState) -> Self {
        state.redis.clone()
    }
}

impl FromRef<AppState> for Arc<AuthCache> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.auth_cache)
    }
}

impl FromRef<AppState> for Arc<RealtimeManager> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.manager)
    }
}

impl FromRef<AppState> for PresenceTracker {
    fn from_ref(state: &AppState) -> Self {
        state.presence.clone()
    }
}

impl FromRef<AppState> for RateLimiter {
    fn from_ref(state: &AppState) -> Self {
        state.limiter.clone()
    }
}

impl FromRef<AppState> for Arc<SnowflakeGenerator> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.ids)
    }
}

impl FromRef<AppState> for Arc<Config> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.config)
    }
}
