use anyhow::Context;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use event_booker::{
    app,
    config::{Config, LogFormat},
    database::Database,
    queue::{DelayedQueue, RedisDelayedQueue},
    redis_client::RedisClient,
    services::{ExpiryWorker, OutboxRelay},
    store::{PgStore, Storage},
    AppState,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    init_tracing(&config);
    info!(environment = %config.app.environment, "Starting Event Booker API");

    // Connect to the database
    let db = Database::connect_with_retry(&config.database)
        .await
        .context("failed to connect to database")?;
    info!("Database connected");

    db.run_migrations()
        .await
        .context("failed to run migrations")?;

    // Connect to Redis
    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("failed to connect to Redis")?;
    info!("Redis connected");

    let store: Arc<dyn Storage> = Arc::new(PgStore::new(&db));
    let queue = RedisDelayedQueue::new(&redis, &config.queue);
    info!(
        waiting = %queue.keys().waiting,
        processing = %queue.keys().processing,
        "Delayed queue ready"
    );
    let queue: Arc<dyn DelayedQueue> = Arc::new(queue);

    // --- Start background tasks ---

    let shutdown = CancellationToken::new();

    let relay = Arc::new(OutboxRelay::new(store.clone(), queue.clone(), config.relay.clone()));
    let relay_task = tokio::spawn(relay.run(shutdown.clone()));

    let worker = Arc::new(ExpiryWorker::new(
        store.clone(),
        queue.clone(),
        config.worker.clone(),
        config.queue.poll_interval(),
    ));
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    // --- Start the web server ---

    let state = AppState::new(&config, store, queue);
    let router = app(state);

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // --- Shutdown: HTTP уже не принимает запросы ---

    info!("Shutting down background tasks");
    shutdown.cancel();
    let (relay_result, worker_result) = tokio::join!(relay_task, worker_task);
    if let Err(e) = relay_result {
        error!(error = %e, "Outbox relay task failed");
    }
    if let Err(e) = worker_result {
        error!(error = %e, "Expiry worker task failed");
    }

    db.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.app.rust_log)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.app.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
