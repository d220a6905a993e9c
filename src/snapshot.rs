// =============================================================================
// Snapshot Cache - durable warm-start copy of the candle series
// =============================================================================
//
// The cache sits behind a two-method key-value interface so the pipeline can
// run against a file-backed store in production and an in-memory double in
// tests. A single named entry holds a JSON array of candles capped at
// `max_data_points`, most recent last.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::FeedError;
use crate::types::Candle;

/// Minimal durable key-value interface. Implementations must not block the
/// calling task.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, FeedError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), FeedError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, FeedError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), FeedError> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// One `<key>.json` file per entry under `dir`, written atomically. Disk I/O
/// runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, FeedError> {
        let path = self.path_for(key);
        run_blocking(move || match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FeedError::Cache(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), FeedError> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let value = value.to_string();
        run_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| {
                FeedError::Cache(format!("failed to create {}: {e}", dir.display()))
            })?;
            let tmp_path = path.with_extension("json.tmp");
            write_then_rename(&tmp_path, &path, &value)
        })
        .await
    }
}

async fn run_blocking<T, F>(op: F) -> Result<T, FeedError>
where
    F: FnOnce() -> Result<T, FeedError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| FeedError::Cache(format!("store task failed: {e}")))?
}

fn write_then_rename(tmp_path: &Path, path: &Path, value: &str) -> Result<(), FeedError> {
    std::fs::write(tmp_path, value).map_err(|e| {
        FeedError::Cache(format!("failed to write {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(tmp_path, path).map_err(|e| {
        FeedError::Cache(format!("failed to rename to {}: {e}", path.display()))
    })
}

// ---------------------------------------------------------------------------
// SnapshotCache
// ---------------------------------------------------------------------------

/// Saves and restores a capped copy of the candle series.
#[derive(Clone)]
pub struct SnapshotCache {
    store: Arc<dyn KeyValueStore>,
    key: String,
    max_data_points: usize,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, max_data_points: usize) -> Self {
        Self {
            store,
            key: key.into(),
            max_data_points,
        }
    }

    /// Persist the most recent `max_data_points` candles, order preserved.
    pub async fn save(&self, candles: &[Candle]) -> Result<(), FeedError> {
        let start = candles.len().saturating_sub(self.max_data_points);
        let capped = &candles[start..];

        let json = serde_json::to_string(capped)
            .map_err(|e| FeedError::Cache(format!("failed to serialise snapshot: {e}")))?;
        self.store.set(&self.key, &json).await?;

        debug!(key = %self.key, candles = capped.len(), "snapshot saved");
        Ok(())
    }

    /// Restore the last saved series. A missing entry yields an empty series;
    /// an unreadable one is a [`FeedError::Cache`].
    pub async fn load(&self) -> Result<Vec<Candle>, FeedError> {
        let Some(json) = self.store.get(&self.key).await? else {
            info!(key = %self.key, "no cached snapshot");
            return Ok(Vec::new());
        };

        let mut candles: Vec<Candle> = serde_json::from_str(&json)
            .map_err(|e| FeedError::Cache(format!("corrupt snapshot {}: {e}", self.key)))?;

        let start = candles.len().saturating_sub(self.max_data_points);
        candles.drain(..start);

        info!(key = %self.key, candles = candles.len(), "snapshot restored");
        Ok(candles)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn candle(bucket_start: i64) -> Candle {
        let p = Decimal::from(bucket_start) / Decimal::from(7);
        Candle {
            bucket_start,
            open: p,
            high: p,
            low: p,
            close: p,
            value: Decimal::ONE,
        }
    }

    /// Store whose writes always fail, like a full quota.
    struct FullStore;

    #[async_trait]
    impl KeyValueStore for FullStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, FeedError> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), FeedError> {
            Err(FeedError::Cache("quota exceeded".into()))
        }
    }

    #[tokio::test]
    async fn missing_snapshot_loads_empty() {
        let cache = SnapshotCache::new(Arc::new(MemoryStore::new()), "candles", 10);
        assert!(cache.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        let series: Vec<Candle> = (0..5).map(|i| candle(i * 60)).collect();

        SnapshotCache::new(store.clone(), "candles", 10).save(&series).await.unwrap();
        // fresh cache over the same store behaves like a new process
        let loaded = SnapshotCache::new(store, "candles", 10).load().await.unwrap();
        assert_eq!(loaded, series);
    }

    #[tokio::test]
    async fn save_keeps_only_most_recent_points() {
        let store = Arc::new(MemoryStore::new());
        let series: Vec<Candle> = (0..8).map(|i| candle(i * 60)).collect();
        let cache = SnapshotCache::new(store, "candles", 3);

        cache.save(&series).await.unwrap();
        let loaded = cache.load().await.unwrap();
        assert_eq!(loaded, series[5..].to_vec());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_cache_error() {
        let store = Arc::new(MemoryStore::new());
        store.set("candles", "{broken").await.unwrap();
        let cache = SnapshotCache::new(store, "candles", 10);
        assert!(matches!(cache.load().await, Err(FeedError::Cache(_))));
    }

    #[tokio::test]
    async fn write_failures_surface_as_cache_errors() {
        let cache = SnapshotCache::new(Arc::new(FullStore), "candles", 10);
        assert_eq!(
            cache.save(&[candle(0)]).await,
            Err(FeedError::Cache("quota exceeded".into()))
        );
    }

    #[tokio::test]
    async fn file_store_roundtrip_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let series: Vec<Candle> = (0..4).map(|i| candle(i * 300)).collect();

        let cache = SnapshotCache::new(Arc::new(FileStore::new(dir.path())), "candle_snapshot", 100);
        cache.save(&series).await.unwrap();

        let reopened =
            SnapshotCache::new(Arc::new(FileStore::new(dir.path())), "candle_snapshot", 100);
        assert_eq!(reopened.load().await.unwrap(), series);
        assert!(dir.path().join("candle_snapshot.json").exists());
        assert!(!dir.path().join("candle_snapshot.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("not_created_yet"));
        assert_eq!(store.get("anything").await.unwrap(), None);
    }
}
