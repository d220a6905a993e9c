// =============================================================================
// Runtime Configuration - Feed settings with atomic save
// =============================================================================
//
// Every tunable of the feed lives here: the upstream endpoint, candle width,
// heartbeat and reconnect timings, history bounds and cache location.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connection::ConnectionConfig;
use crate::market_data::HistoryLimits;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_endpoint() -> String {
    "ws://127.0.0.1:9001/candles".to_string()
}

fn default_interval_seconds() -> i64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    25
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_reconnect_interval_ms() -> u64 {
    3_000
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_max_data_points() -> usize {
    10_000
}

fn default_cleanup_threshold() -> usize {
    15_000
}

fn default_compaction_interval_secs() -> u64 {
    300
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("feed_cache")
}

fn default_snapshot_key() -> String {
    "candle_snapshot".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Top-level runtime configuration for the candle feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Upstream ------------------------------------------------------------

    /// WebSocket endpoint of the market-data feed.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Initial candle width in seconds.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: i64,

    // --- Connection ----------------------------------------------------------

    /// Seconds between outbound keep-alive tokens.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Seconds of silence after which the connection is considered dead.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Retries after a disconnect before the state becomes `Closed`.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    // --- History bounds ------------------------------------------------------

    /// Soft cap the buffers are trimmed back to.
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,

    /// Hard threshold that triggers a trim.
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: usize,

    /// Seconds between periodic compactions.
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    // --- Snapshot cache ------------------------------------------------------

    /// Directory backing the durable key-value store.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Key the candle snapshot is stored under.
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,

    // --- API -----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            interval_seconds: default_interval_seconds(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            max_data_points: default_max_data_points(),
            cleanup_threshold: default_cleanup_threshold(),
            compaction_interval_secs: default_compaction_interval_secs(),
            cache_dir: default_cache_dir(),
            snapshot_key: default_snapshot_key(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            endpoint = %config.endpoint,
            interval_seconds = config.interval_seconds,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Apply `FEED_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("FEED_ENDPOINT").filter(|s| !s.trim().is_empty()) {
            self.endpoint = endpoint.trim().to_string();
        }
        if let Some(secs) = lookup("FEED_INTERVAL_SECS").and_then(|s| s.trim().parse().ok()) {
            self.interval_seconds = secs;
        }
        if let Some(addr) = lookup("FEED_BIND_ADDR").filter(|s| !s.trim().is_empty()) {
            self.bind_addr = addr.trim().to_string();
        }
        if let Some(dir) = lookup("FEED_CACHE_DIR").filter(|s| !s.trim().is_empty()) {
            self.cache_dir = PathBuf::from(dir.trim());
        }
    }

    /// Clamp values that would break the pipeline back to sane defaults.
    pub fn sanitize(&mut self) {
        if self.interval_seconds <= 0 {
            self.interval_seconds = default_interval_seconds();
        }
        if self.max_data_points == 0 {
            self.max_data_points = default_max_data_points();
        }
        if self.cleanup_threshold < self.max_data_points {
            self.cleanup_threshold = self.max_data_points;
        }
        if self.compaction_interval_secs == 0 {
            self.compaction_interval_secs = default_compaction_interval_secs();
        }
    }

    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_data_points: self.max_data_points,
            cleanup_threshold: self.cleanup_threshold,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }
}
