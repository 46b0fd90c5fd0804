//! Guardrail demo server.
//!
//! Wires the cache manager and rate limiter together behind a small axum
//! router and runs until Ctrl+C.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use guardrail::cache::{CacheConfig, CacheManager};
use guardrail::config::{Config, SnapshotBackend};
use guardrail::database::{Database, FileSnapshotStore, MemorySnapshotStore, MongoSnapshotStore, SnapshotStore};
use guardrail::events::{EventBus, InProcessBus};
use guardrail::http::{self, AppState};
use guardrail::limiter::RateLimiter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("guardrail=info,mongodb=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("Starting guardrail...");

    let config = Config::from_env()?;
    info!("Configuration loaded successfully");
    info!("Snapshot backend: {:?}", config.snapshot_backend);

    let snapshots: Arc<dyn SnapshotStore> = match config.snapshot_backend {
        SnapshotBackend::Memory => Arc::new(MemorySnapshotStore::new()),
        SnapshotBackend::File => Arc::new(FileSnapshotStore::new(&config.snapshot_dir)),
        SnapshotBackend::Mongo => {
            let uri = config.mongodb_uri.as_deref().unwrap_or_default();
            info!("Connecting to MongoDB...");
            let db = Database::connect(uri, &config.mongodb_database).await?;
            Arc::new(MongoSnapshotStore::new(&db))
        }
    };

    let bus: Arc<dyn EventBus> = InProcessBus::new();

    let cache: CacheManager<Value> = CacheManager::builder()
        .defaults(
            CacheConfig::default()
                .ttl(config.cache_default_ttl)
                .max_size(config.cache_max_size),
        )
        .event_bus(bus)
        .sweep_interval(config.cache_sweep_interval)
        .prefetch_scan_interval(config.cache_prefetch_interval)
        .build();
    cache.init();

    let limiter = RateLimiter::builder()
        .history_capacity(config.history_capacity)
        .snapshot_store(snapshots)
        .build();
    limiter.restore().await;
    limiter.init();

    let app = http::router(AppState {
        cache: cache.clone(),
        limiter: limiter.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("📡 Listening on: {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    cache.shutdown().await;
    limiter.shutdown().await;

    info!("Guardrail stopped");
    Ok(())
}
