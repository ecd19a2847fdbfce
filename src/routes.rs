/**
 * Router Configuration
 *
 * This module provides the main router creation function that combines
 * all route configurations into a single Axum router.
 *
 * # Route Details
 *
 * - `GET /ws` - Realtime websocket upgrade
 * - `GET /health` - Liveness probe
 * - `POST /auth/refresh` - Token refresh (rate limited per client IP)
 * - `POST /auth/logout` - Session revocation
 * - `POST /auth/password` - Password change
 * - `POST /auth/confirm-email` - Pending email confirmation
 */

use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::trace::TraceLayer;

use crate::auth::handlers::{change_password, confirm_email, logout, refresh};
use crate::error::ApiResponse;
use crate::limiter::login_rate_limit;
use crate::realtime::ws_handler;
use crate::state::AppState;

/// Create the Axum router with all routes configured
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/password", post(change_password))
        .route("/auth/confirm-email", post(confirm_email))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            login_rate_limit,
        ));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .merge(auth_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - liveness probe
async fn health() -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::empty())
}
