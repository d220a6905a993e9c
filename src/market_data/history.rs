// =============================================================================
// Bounded History Store - raw tick buffer + derived candle series
// =============================================================================
//
// Both sequences are bounded FIFOs: once a buffer grows past the cleanup
// threshold it is cut back to the most recent `max_data_points` entries.
// Compaction runs after every bulk merge and from a periodic timer owned by
// the pipeline, so memory stays bounded even when traffic is only
// incremental.
// =============================================================================

use tracing::debug;

use crate::market_data::aggregator::{self, AggregateMode, Aggregation};
use crate::types::{Candle, Tick};

/// Soft cap the buffers are trimmed back to.
pub const MAX_DATA_POINTS: usize = 10_000;
/// Hard threshold that triggers a trim.
pub const CLEANUP_THRESHOLD: usize = 15_000;

/// Size bounds applied to the raw buffer and the candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_data_points: usize,
    pub cleanup_threshold: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_data_points: MAX_DATA_POINTS,
            cleanup_threshold: CLEANUP_THRESHOLD,
        }
    }
}

/// Trim `items` to the most recent `max_data_points` entries if it has grown
/// past `cleanup_threshold`; otherwise return it unchanged.
pub fn compact<T>(mut items: Vec<T>, limits: HistoryLimits) -> Vec<T> {
    if items.len() > limits.cleanup_threshold {
        let excess = items.len().saturating_sub(limits.max_data_points);
        items.drain(..excess);
    }
    items
}

/// Owns the raw buffer, the candle series derived from it and the interval the
/// series is currently bucketed at.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    raw: Vec<Tick>,
    candles: Vec<Candle>,
    interval_seconds: i64,
    limits: HistoryLimits,
}

impl HistoryStore {
    pub fn new(interval_seconds: i64, limits: HistoryLimits) -> Self {
        Self {
            raw: Vec::new(),
            candles: Vec::new(),
            interval_seconds,
            limits,
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &[Tick] {
        &self.raw
    }

    pub fn raw_len(&self) -> usize {
        self.raw.len()
    }

    pub fn interval_seconds(&self) -> i64 {
        self.interval_seconds
    }

    /// Build a store from arbitrary parts, bypassing the merge-time trim.
    #[cfg(test)]
    pub(crate) fn from_parts(
        raw: Vec<Tick>,
        candles: Vec<Candle>,
        interval_seconds: i64,
        limits: HistoryLimits,
    ) -> Self {
        Self {
            raw,
            candles,
            interval_seconds,
            limits,
        }
    }

    /// Replace the whole history with cached, already-bucketed candles.
    ///
    /// The candles are kept as pseudo-ticks in the raw buffer so that a later
    /// interval change can re-bucket them.
    pub fn seed_from_candles(&mut self, cached: &[Candle]) {
        let mut raw: Vec<Tick> = cached.iter().map(Candle::as_tick).collect();
        raw.sort_by_key(|t| t.time);
        self.raw = compact(raw, self.limits);
        self.candles = aggregator::build_candles(&self.raw, self.interval_seconds);
    }

    /// Merge a backfill batch. Always changes the store.
    pub fn apply_bulk(&mut self, ticks: Vec<Tick>) -> bool {
        self.apply(ticks, AggregateMode::Bulk)
    }

    /// Apply a single live update. Returns `false` when the update was a no-op.
    pub fn apply_incremental(&mut self, tick: Tick) -> bool {
        self.apply(vec![tick], AggregateMode::Incremental)
    }

    fn apply(&mut self, ticks: Vec<Tick>, mode: AggregateMode) -> bool {
        let raw = std::mem::take(&mut self.raw);
        let Aggregation {
            buffer,
            candles,
            changed,
        } = aggregator::aggregate(raw, ticks, self.interval_seconds, mode, self.limits);

        self.raw = buffer;
        if let Some(candles) = candles {
            self.candles = candles;
        }
        changed
    }

    /// Re-bucket the existing raw buffer at a new width. Returns `false` when
    /// the interval is unchanged.
    pub fn set_interval(&mut self, interval_seconds: i64) -> bool {
        if interval_seconds == self.interval_seconds {
            return false;
        }
        self.interval_seconds = interval_seconds;
        self.candles = aggregator::rebucket(&self.raw, interval_seconds);
        true
    }

    /// Periodic safety-net compaction of both buffers. Returns `true` when
    /// anything was evicted.
    pub fn compact(&mut self) -> bool {
        let raw_before = self.raw.len();
        let candles_before = self.candles.len();

        self.raw = compact(std::mem::take(&mut self.raw), self.limits);
        self.candles = compact(std::mem::take(&mut self.candles), self.limits);

        let evicted = raw_before != self.raw.len() || candles_before != self.candles.len();
        if evicted {
            debug!(
                raw_before,
                raw_after = self.raw.len(),
                candles_before,
                candles_after = self.candles.len(),
                "history compacted"
            );
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn flat_tick(time: i64, price: Decimal) -> Tick {
        Tick {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(1),
        }
    }

    fn small_limits() -> HistoryLimits {
        HistoryLimits {
            max_data_points: 3,
            cleanup_threshold: 5,
        }
    }

    #[test]
    fn compact_below_threshold_is_identity() {
        let items: Vec<u32> = (0..5).collect();
        assert_eq!(compact(items.clone(), small_limits()), items);
    }

    #[test]
    fn compact_keeps_most_recent_entries() {
        let items: Vec<u32> = (0..6).collect();
        assert_eq!(compact(items, small_limits()), vec![3, 4, 5]);
    }

    #[test]
    fn repeated_bulk_merges_stay_bounded() {
        let mut store = HistoryStore::new(60, HistoryLimits::default());
        let mut time = 0;
        for _ in 0..4 {
            let batch: Vec<Tick> = (0..5_000)
                .map(|_| {
                    time += 1;
                    flat_tick(time, dec!(1))
                })
                .collect();
            store.apply_bulk(batch);
            assert!(store.raw_len() <= CLEANUP_THRESHOLD);
        }
        // 20_000 ingested: the last merge crossed the threshold and was cut back.
        assert_eq!(store.raw_len(), MAX_DATA_POINTS);
        assert_eq!(store.raw().last().map(|t| t.time), Some(20_000));
        assert_eq!(store.raw().first().map(|t| t.time), Some(10_001));
    }

    #[test]
    fn bulk_merges_trim_once_threshold_is_crossed() {
        let mut store = HistoryStore::new(1, small_limits());
        store.apply_bulk(vec![flat_tick(0, dec!(1)), flat_tick(1, dec!(1))]);
        store.apply_bulk(vec![flat_tick(2, dec!(1)), flat_tick(3, dec!(1))]);
        assert_eq!(store.raw_len(), 4);

        store.apply_bulk(vec![flat_tick(4, dec!(1)), flat_tick(5, dec!(1))]);
        let times: Vec<i64> = store.raw().iter().map(|t| t.time).collect();
        assert_eq!(times, vec![3, 4, 5]);
        assert_eq!(store.candles().len(), 3);
    }

    #[test]
    fn periodic_compaction_is_noop_at_threshold() {
        let mut store = HistoryStore::new(1, small_limits());
        let cached: Vec<Candle> = (0..5)
            .map(|t| Candle::seed(t, &flat_tick(t, dec!(1))))
            .collect();
        store.seed_from_candles(&cached);

        assert!(!store.compact());
        assert_eq!(store.raw_len(), 5);
        assert_eq!(store.candles().len(), 5);
    }

    #[test]
    fn periodic_compaction_trims_both_buffers_to_newest() {
        let raw: Vec<Tick> = (0..8).map(|t| flat_tick(t, dec!(1))).collect();
        let candles: Vec<Candle> = (0..7)
            .map(|t| Candle::seed(t, &flat_tick(t, dec!(1))))
            .collect();
        let mut store = HistoryStore::from_parts(raw, candles, 1, small_limits());

        assert!(store.compact());
        let raw_times: Vec<i64> = store.raw().iter().map(|t| t.time).collect();
        let starts: Vec<i64> = store.candles().iter().map(|c| c.bucket_start).collect();
        assert_eq!(raw_times, vec![5, 6, 7]);
        assert_eq!(starts, vec![4, 5, 6]);

        // already within bounds: a second pass evicts nothing
        assert!(!store.compact());
    }

    #[test]
    fn periodic_compaction_trims_candles_alone() {
        let raw: Vec<Tick> = (0..4).map(|t| flat_tick(t, dec!(1))).collect();
        let candles: Vec<Candle> = (0..6)
            .map(|t| Candle::seed(t * 60, &flat_tick(t * 60, dec!(1))))
            .collect();
        let mut store = HistoryStore::from_parts(raw, candles, 60, small_limits());

        assert!(store.compact());
        assert_eq!(store.raw_len(), 4);
        assert_eq!(store.candles().len(), 3);
        assert_eq!(store.candles()[0].bucket_start, 180);
    }

    #[test]
    fn set_interval_rebuckets_without_new_data() {
        let mut store = HistoryStore::new(60, HistoryLimits::default());
        store.apply_bulk((0..4).map(|i| flat_tick(i * 60, dec!(1))).collect());
        assert_eq!(store.candles().len(), 4);

        assert!(store.set_interval(120));
        assert_eq!(store.candles().len(), 2);
        assert_eq!(store.raw_len(), 4);
        assert!(!store.set_interval(120));
    }

    #[test]
    fn seeding_from_cache_allows_rebucketing() {
        let cached: Vec<Candle> = (0..6)
            .map(|i| Candle::seed(i * 60, &flat_tick(i * 60, dec!(2))))
            .collect();
        let mut store = HistoryStore::new(60, HistoryLimits::default());
        store.seed_from_candles(&cached);
        assert_eq!(store.candles(), cached.as_slice());

        store.set_interval(180);
        assert_eq!(store.candles().len(), 2);
        assert_eq!(store.candles()[0].value, dec!(3));
    }
}
