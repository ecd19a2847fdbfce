/**
 * Server Configuration
 *
 * This module loads the runtime configuration from environment variables.
 * Infrastructure endpoints (PostgreSQL, Redis) are required; key material
 * falls back to development defaults with a loud warning so a bare checkout
 * still boots locally.
 *
 * # Process Identity
 *
 * Every process carries a `(server_id, worker_id)` pair. The pair feeds the
 * snowflake generator and the janitor's sharding formula, so two live
 * processes must never share one.
 */

use std::net::SocketAddr;

/// Runtime configuration, loaded once at startup and shared via `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WS listener binds to
    pub bind_addr: SocketAddr,
    /// PostgreSQL connection string
    pub database_url: String,
    /// Redis connection string (shared KV, pub/sub bus, push stream)
    pub redis_url: String,

    /// Key for access tokens (12 h lifetime)
    pub access_token_key: String,
    /// Key for refresh tokens (30 d lifetime), distinct from the access key
    pub refresh_token_key: String,
    /// Key for the detached HMAC signature over token ciphertext
    pub signing_key: String,
    /// Key for email-verification tokens
    pub email_token_key: String,

    /// VAPID EC private key (PEM) for web-push JWTs
    pub vapid_private_pem: Option<String>,
    /// VAPID public key, base64url, sent in the `k=` parameter
    pub vapid_public_key: String,
    /// VAPID subject (`mailto:` or origin URL)
    pub vapid_subject: String,

    /// Base URL of the object-storage service (janitor DELETE contract)
    pub storage_base_url: String,

    /// Host index, 0..31
    pub server_id: u16,
    /// Process index within the host, 0..31
    pub worker_id: u16,
    /// Total hosts, for janitor sharding
    pub total_servers: i64,
    /// Total workers per host, for janitor sharding
    pub total_workers: i64,
}

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when `DATABASE_URL` or `REDIS_URL` is absent or
    /// a numeric variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("SERVER_PORT", 3000u16)?;
        let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let bind_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "SERVER_HOST",
                value: host.clone(),
            })?;

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let redis_url =
            std::env::var("REDIS_URL").map_err(|_| ConfigError::Missing("REDIS_URL"))?;

        Ok(Self {
            bind_addr,
            database_url,
            redis_url,
            access_token_key: key_var("ACCESS_TOKEN_KEY"),
            refresh_token_key: key_var("REFRESH_TOKEN_KEY"),
            signing_key: key_var("TOKEN_SIGNING_KEY"),
            email_token_key: key_var("EMAIL_TOKEN_KEY"),
            vapid_private_pem: std::env::var("VAPID_PRIVATE_PEM").ok(),
            vapid_public_key: std::env::var("VAPID_PUBLIC_KEY").unwrap_or_default(),
            vapid_subject: std::env::var("VAPID_SUBJECT")
                .unwrap_or_else(|_| "mailto:ops@localhost".to_string()),
            storage_base_url: std::env::var("STORAGE_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
            server_id: parse_var("SERVER_ID", 0u16)?,
            worker_id: parse_var("WORKER_ID", default_worker_id())?,
            total_servers: parse_var("TOTAL_SERVERS", 1i64)?,
            total_workers: parse_var("TOTAL_WORKERS", 1i64)?,
        })
    }

    /// Consumer name for the push stream: one per (server, worker) pair.
    pub fn push_consumer_name(&self) -> String {
        format!("worker-{}-{}", self.server_id, self.worker_id)
    }
}

/// Worker index derived from process identity when WORKER_ID is unset.
fn default_worker_id() -> u16 {
    (std::process::id() % 32) as u16
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}

fn key_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| {
        tracing::warn!("{name} not set; using development default. Do NOT run this in production.");
        format!("dev-{}-change-me", name.to_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_minimal_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/lv_test");
        std::env::set_var("REDIS_URL", "redis://127.0.0.1/");
    }

    #[test]
    #[serial]
    fn test_from_env_minimal() {
        set_minimal_env();
        std::env::remove_var("SERVER_PORT");
        std::env::remove_var("SERVER_ID");
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.server_id, 0);
        assert_eq!(config.total_servers, 1);
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        std::env::remove_var("DATABASE_URL");
        std::env::set_var("REDIS_URL", "redis://127.0.0.1/");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_numeric_var() {
        set_minimal_env();
        std::env::set_var("SERVER_PORT", "not-a-port");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Invalid { name: "SERVER_PORT", .. })));
        std::env::remove_var("SERVER_PORT");
    }

    #[test]
    #[serial]
    fn test_push_consumer_name() {
        set_minimal_env();
        std::env::set_var("SERVER_ID", "2");
        std::env::set_var("WORKER_ID", "5");
        let config = Config::from_env().unwrap();
        assert_eq!(config.push_consumer_name(), "worker-2-5");
        std::env::remove_var("SERVER_ID");
        std::env::remove_var("WORKER_ID");
    }
}
