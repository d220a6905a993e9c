// =============================================================================
// Feed State - the single-writer state behind every published snapshot
// =============================================================================
//
// Only the pipeline's event loop mutates `FeedState`. Readers never touch it:
// every meaningful mutation builds a fresh immutable `FeedSnapshot` and swaps
// it into a `watch` channel, so any number of consumers can hold and read a
// snapshot while the next one is being prepared.
//
// Versioning:
//   - `version` increments on every publish so pollers (REST, the push socket)
//     can cheaply detect change.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::market_data::{HistoryLimits, HistoryStore};
use crate::types::{Candle, ConnectionState};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Error category, e.g. `cache` or `parse`.
    pub kind: &'static str,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// FeedSnapshot
// =============================================================================

/// Immutable view of the feed handed to consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub version: u64,
    pub candle_series: Arc<[Candle]>,
    pub connection_state: ConnectionState,
    pub interval_seconds: i64,
    pub is_loading: bool,
    pub last_error: Option<String>,
    pub raw_len: usize,
    pub recent_errors: Arc<[ErrorRecord]>,
    pub updated_at: String,
}

impl FeedSnapshot {
    /// Snapshot published before anything is known.
    pub fn initial(interval_seconds: i64) -> Self {
        Self {
            version: 0,
            candle_series: Arc::from(Vec::new()),
            connection_state: ConnectionState::Connecting,
            interval_seconds,
            is_loading: true,
            last_error: None,
            raw_len: 0,
            recent_errors: Arc::from(Vec::new()),
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

// =============================================================================
// FeedState
// =============================================================================

pub struct FeedState {
    pub history: HistoryStore,
    pub connection_state: ConnectionState,
    pub is_loading: bool,
    pub last_error: Option<String>,
    recent_errors: Vec<ErrorRecord>,
    version: u64,
    publisher: watch::Sender<Arc<FeedSnapshot>>,
}

impl FeedState {
    pub fn new(
        interval_seconds: i64,
        limits: HistoryLimits,
        publisher: watch::Sender<Arc<FeedSnapshot>>,
    ) -> Self {
        Self {
            history: HistoryStore::new(interval_seconds, limits),
            connection_state: ConnectionState::Connecting,
            is_loading: true,
            last_error: None,
            recent_errors: Vec::new(),
            version: 0,
            publisher,
        }
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error. The ring buffer is capped at [`MAX_RECENT_ERRORS`];
    /// oldest entries are evicted when the limit is reached.
    pub fn push_error(&mut self, kind: &'static str, message: String) {
        self.recent_errors.push(ErrorRecord {
            message,
            kind,
            at: Utc::now().to_rfc3339(),
        });
        while self.recent_errors.len() > MAX_RECENT_ERRORS {
            self.recent_errors.remove(0);
        }
    }

    pub fn recent_errors(&self) -> &[ErrorRecord] {
        &self.recent_errors
    }

    // ── Snapshot Publishing ─────────────────────────────────────────────

    /// Build a fresh snapshot from the current state and publish it.
    pub fn publish(&mut self) -> Arc<FeedSnapshot> {
        self.version += 1;

        let snapshot = Arc::new(FeedSnapshot {
            version: self.version,
            candle_series: Arc::from(self.history.candles()),
            connection_state: self.connection_state,
            interval_seconds: self.history.interval_seconds(),
            is_loading: self.is_loading,
            last_error: self.last_error.clone(),
            raw_len: self.history.raw_len(),
            recent_errors: Arc::from(self.recent_errors.as_slice()),
            updated_at: Utc::now().to_rfc3339(),
        });

        self.publisher.send_replace(snapshot.clone());
        snapshot
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tick;
    use rust_decimal_macros::dec;

    fn state() -> (FeedState, watch::Receiver<Arc<FeedSnapshot>>) {
        let (tx, rx) = watch::channel(Arc::new(FeedSnapshot::initial(60)));
        (FeedState::new(60, HistoryLimits::default(), tx), rx)
    }

    #[test]
    fn publish_increments_version_and_reaches_readers() {
        let (mut state, rx) = state();
        assert_eq!(rx.borrow().version, 0);

        state.publish();
        state.publish();
        assert_eq!(rx.borrow().version, 2);
        assert_eq!(state.version, 2);
    }

    #[test]
    fn published_snapshots_are_not_mutated_afterwards() {
        let (mut state, rx) = state();
        let t = Tick {
            time: 0,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(1),
        };
        state.history.apply_bulk(vec![t, t]);
        let held = state.publish();
        assert_eq!(held.candle_series.len(), 1);

        let later = Tick { time: 120, ..t };
        state.history.apply_bulk(vec![later, later]);
        state.publish();

        assert_eq!(held.candle_series.len(), 1);
        assert_eq!(rx.borrow().candle_series.len(), 2);
    }

    #[test]
    fn error_ring_is_bounded() {
        let (mut state, _rx) = state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error("cache", format!("failure {i}"));
        }
        assert_eq!(state.recent_errors().len(), MAX_RECENT_ERRORS);
        assert_eq!(state.recent_errors()[0].message, "failure 5");
    }

    #[test]
    fn snapshot_serialises_with_consumer_field_names() {
        let (mut state, _rx) = state();
        let snapshot = state.publish();
        let json = serde_json::to_value(&*snapshot).unwrap();
        assert_eq!(json["intervalSeconds"], 60);
        assert_eq!(json["isLoading"], true);
        assert_eq!(json["connectionState"], "Connecting");
        assert!(json["lastError"].is_null());
        assert!(json["candleSeries"].as_array().unwrap().is_empty());
    }
}
