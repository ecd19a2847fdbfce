//! LV Realtime - Main Library
//!
//! Realtime delivery core for a social network: snowflake IDs, encrypted
//! session tokens backed by a rotating credential store, a three-tier
//! auth cache, presence tracking, pub/sub fan-out to websocket
//! connections, a durable web-push pipeline, and the periodic janitor.
//!
//! # Module Structure
//!
//! - **`snowflake`** - 64-bit time-ordered ID generation and parsing
//! - **`auth`** - Token codec, credential store, auth cache, password
//!   hashing, and the session-lifecycle HTTP handlers
//! - **`limiter`** - Atomic sliding-window rate limiting
//! - **`presence`** - Per-session activity tracking and `is_online`
//! - **`realtime`** - Websocket protocol, broker bridge, per-worker
//!   manager, and the connection state machine
//! - **`push`** - Capped notification stream and web-push workers
//! - **`scheduler`** - Adaptive-interval cleanup jobs
//! - **`notification`** - The payload model shared by all of the above
//!
//! # Process Model
//!
//! One process is one worker. Several workers per host and several hosts
//! are expected; each process carries a distinct `(server_id, worker_id)`
//! pair which feeds the ID generator, the push consumer name, and the
//! cleanup sharding.

pub mod auth;
pub mod config;
pub mod error;
pub mod limiter;
pub mod notification;
pub mod presence;
pub mod push;
pub mod realtime;
pub mod routes;
pub mod scheduler;
pub mod snowflake;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResponse, ErrorCode};
pub use snowflake::SnowflakeGenerator;
pub use state::AppState;
