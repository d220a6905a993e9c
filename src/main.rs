// =============================================================================
// Candle Feed - Main Entry Point
// =============================================================================
//
// Hydrates the candle series from the on-disk snapshot, joins the shared
// market-data connection and serves the live series over HTTP and WebSocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod connection;
mod error;
mod market_data;
mod pipeline;
mod runtime_config;
mod snapshot;
mod types;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::connection::{ConnectionHub, WsConnector};
use crate::pipeline::{spawn_feed, FeedSettings};
use crate::runtime_config::FeedConfig;
use crate::snapshot::{FileStore, KeyValueStore, MemoryStore, SnapshotCache};

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Feed starting up");

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    config.apply_env_overrides();
    config.sanitize();

    info!(
        endpoint = %config.endpoint,
        interval_seconds = config.interval_seconds,
        cache_dir = %config.cache_dir.display(),
        "Configuration resolved"
    );

    // ── 2. Snapshot cache ────────────────────────────────────────────────
    // An empty cache_dir disables warm starts across restarts.
    let store: Arc<dyn KeyValueStore> = if config.cache_dir.as_os_str().is_empty() {
        warn!("No cache_dir configured, snapshots are kept in memory only");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::new(config.cache_dir.clone()))
    };
    let cache = SnapshotCache::new(store, config.snapshot_key.clone(), config.max_data_points);

    // ── 3. Shared connection + feed pipeline ─────────────────────────────
    let hub = ConnectionHub::new(Arc::new(WsConnector), config.connection_config());
    let settings = FeedSettings {
        endpoint: config.endpoint.clone(),
        interval_seconds: config.interval_seconds,
        limits: config.history_limits(),
        compaction_interval: config.compaction_interval(),
    };
    let (feed, feed_task) = spawn_feed(hub.clone(), settings, cache);

    // ── 4. API server ────────────────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        feed: feed.clone(),
        hub,
    });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    config.interval_seconds = feed.interval_seconds();
    feed.shutdown();
    if let Err(e) = feed_task.await {
        error!(error = %e, "Feed task ended abnormally");
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("Candle Feed shut down complete.");
    Ok(())
}
