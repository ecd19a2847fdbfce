/**
 * LV Realtime Server Entry Point
 *
 * Initializes configuration, storage handles, and the per-worker
 * singletons, spawns the background loops (auth-cache sweeper, realtime
 * fan-in, push worker, scheduler), then serves the Axum app.
 */

use std::net::SocketAddr;
use std::sync::Arc;

use lv_realtime::auth::cache::AuthCache;
use lv_realtime::auth::password::PasswordHasher;
use lv_realtime::limiter::RateLimiter;
use lv_realtime::presence::PresenceTracker;
use lv_realtime::push::{PushWorker, VapidSigner};
use lv_realtime::realtime::RealtimeManager;
use lv_realtime::routes::create_router;
use lv_realtime::scheduler::{JobContext, Scheduler};
use lv_realtime::snowflake::SnowflakeGenerator;
use lv_realtime::{AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(
        server_id = config.server_id,
        worker_id = config.worker_id,
        "[STARTUP] Configuration loaded"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await?;
    tracing::info!("[STARTUP] Database pool connected");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
    tracing::info!("[STARTUP] Shared KV connected");

    let ids = Arc::new(SnowflakeGenerator::new(config.server_id, config.worker_id));

    let auth_cache = Arc::new(AuthCache::new(
        redis.clone(),
        pool.clone(),
        config.access_token_key.clone(),
        config.signing_key.clone(),
    ));
    let _sweeper = auth_cache.start_sweeper();

    let manager = Arc::new(RealtimeManager::new(
        redis.clone(),
        redis_client.clone(),
        pool.clone(),
        Arc::clone(&ids),
    ));
    tokio::spawn(Arc::clone(&manager).start());

    let presence = PresenceTracker::new(redis.clone());

    let vapid = match &config.vapid_private_pem {
        Some(pem) => match VapidSigner::from_pem(
            pem,
            config.vapid_public_key.clone(),
            config.vapid_subject.clone(),
        ) {
            Ok(signer) => Some(signer),
            Err(e) => {
                tracing::warn!("[STARTUP] VAPID key unusable, web push disabled: {e}");
                None
            }
        },
        None => {
            tracing::warn!("[STARTUP] No VAPID key configured, web push disabled");
            None
        }
    };
    // The worker's blocking stream reads run on a connection of their
    // own; handing it the shared manager would park every multiplexed
    // command behind an idle XREADGROUP.
    let push_worker = PushWorker::new(
        redis_client.clone(),
        pool.clone(),
        presence.clone(),
        vapid,
        config.push_consumer_name(),
    );
    tokio::spawn(push_worker.run());

    let scheduler = Scheduler::new(JobContext {
        pool: pool.clone(),
        http: reqwest::Client::new(),
        storage_base_url: config.storage_base_url.clone(),
        server_id: i64::from(config.server_id),
        worker_id: i64::from(config.worker_id),
        total_servers: config.total_servers,
        total_workers: config.total_workers,
    });
    tokio::spawn(scheduler.run());

    let state = AppState {
        pool,
        limiter: RateLimiter::new(redis.clone()),
        redis,
        redis_client,
        auth_cache,
        manager,
        presence,
        hasher: PasswordHasher::new(4),
        ids,
        config: Arc::clone(&config),
    };

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("[STARTUP] Listening on {}", config.bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
