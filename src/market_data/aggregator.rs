// =============================================================================
// Candle Aggregator - buckets raw ticks into fixed-width OHLCV candles
// =============================================================================
//
// Bulk batches are merged, compacted and sorted by time before bucketing, so
// the resulting series does not depend on arrival order. Incremental updates
// only ever replace the last buffered tick and are applied in arrival order.
// The buffer stays sorted by time: a replacement older than its predecessor
// is moved back into place, so the series never repeats or goes backwards.
//
// Every accepted update re-buckets the whole raw buffer (O(buffer)). The
// buffer is bounded by the history limits, which keeps this affordable.
// =============================================================================

use crate::market_data::history::{compact, HistoryLimits};
use crate::types::{Candle, Tick};

/// How a batch of new ticks should be merged into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// Backfill / resync batch.
    Bulk,
    /// Live update to the currently forming period.
    Incremental,
}

/// Result of merging new ticks into the raw buffer.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub buffer: Vec<Tick>,
    /// Rebuilt series, or `None` when the update was a no-op.
    pub candles: Option<Vec<Candle>>,
    pub changed: bool,
}

/// Start of the bucket containing `time`: `floor(time / interval) * interval`.
pub fn bucket_start(time: i64, interval_seconds: i64) -> i64 {
    time.div_euclid(interval_seconds) * interval_seconds
}

/// Bucket an already time-sorted slice of ticks in a single pass.
pub fn build_candles(sorted: &[Tick], interval_seconds: i64) -> Vec<Candle> {
    let mut candles: Vec<Candle> = Vec::new();
    let mut current: Option<Candle> = None;

    for tick in sorted {
        let key = bucket_start(tick.time, interval_seconds);
        match current.as_mut() {
            Some(open) if open.bucket_start == key => open.absorb(tick),
            _ => {
                if let Some(done) = current.take() {
                    candles.push(done);
                }
                current = Some(Candle::seed(key, tick));
            }
        }
    }

    if let Some(done) = current {
        candles.push(done);
    }
    candles
}

/// Re-bucket an existing buffer at a (possibly different) interval. The
/// buffer is not assumed to be sorted.
pub fn rebucket(buffer: &[Tick], interval_seconds: i64) -> Vec<Candle> {
    let mut sorted = buffer.to_vec();
    sorted.sort_by_key(|t| t.time);
    build_candles(&sorted, interval_seconds)
}

/// Merge `new_ticks` into `buffer` and derive the candle series.
pub fn aggregate(
    buffer: Vec<Tick>,
    new_ticks: Vec<Tick>,
    interval_seconds: i64,
    mode: AggregateMode,
    limits: HistoryLimits,
) -> Aggregation {
    match mode {
        AggregateMode::Bulk => merge_bulk(buffer, new_ticks, interval_seconds, limits),
        AggregateMode::Incremental => {
            let mut buffer = buffer;
            let mut changed = false;
            for tick in new_ticks {
                changed |= apply_live_tick(&mut buffer, tick);
            }
            let candles = changed.then(|| build_candles(&buffer, interval_seconds));
            Aggregation {
                buffer,
                candles,
                changed,
            }
        }
    }
}

fn merge_bulk(
    mut buffer: Vec<Tick>,
    new_ticks: Vec<Tick>,
    interval_seconds: i64,
    limits: HistoryLimits,
) -> Aggregation {
    buffer.extend(new_ticks);
    let mut buffer = compact(buffer, limits);
    buffer.sort_by_key(|t| t.time);
    let candles = build_candles(&buffer, interval_seconds);
    Aggregation {
        buffer,
        candles: Some(candles),
        changed: true,
    }
}

/// Replace the last buffered tick when the period's high moved or a newer
/// period started. Returns `false` for a no-op.
fn apply_live_tick(buffer: &mut Vec<Tick>, tick: Tick) -> bool {
    match buffer.last_mut() {
        None => {
            buffer.push(tick);
            true
        }
        Some(last) if tick.high != last.high || tick.time > last.time => {
            *last = tick;
            restore_last_in_order(buffer);
            true
        }
        Some(_) => false,
    }
}

/// Move the last tick back to its time-ordered position. Everything before it
/// is already sorted; equal times keep the replacement after existing ticks.
fn restore_last_in_order(buffer: &mut [Tick]) {
    let Some((last, sorted)) = buffer.split_last() else {
        return;
    };
    let position = sorted.partition_point(|t| t.time <= last.time);
    buffer[position..].rotate_right(1);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn tick(time: i64, o: Decimal, h: Decimal, l: Decimal, c: Decimal, v: Decimal) -> Tick {
        Tick {
            time,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    fn sample_ticks() -> Vec<Tick> {
        (0..40)
            .map(|i| {
                let base = Decimal::from(100 + (i * 7) % 13);
                tick(
                    i * 17,
                    base,
                    base + dec!(0.5),
                    base - dec!(0.25),
                    base + dec!(0.1),
                    Decimal::from(i % 5) + dec!(0.3),
                )
            })
            .collect()
    }

    fn bulk(ticks: Vec<Tick>, interval: i64) -> Aggregation {
        aggregate(
            Vec::new(),
            ticks,
            interval,
            AggregateMode::Bulk,
            HistoryLimits::default(),
        )
    }

    #[test]
    fn bucket_start_floors_to_interval() {
        assert_eq!(bucket_start(0, 60), 0);
        assert_eq!(bucket_start(59, 60), 0);
        assert_eq!(bucket_start(60, 60), 60);
        assert_eq!(bucket_start(1_700_000_123, 300), 1_700_000_100);
        assert_eq!(bucket_start(-1, 60), -60);
    }

    #[test]
    fn every_candle_starts_on_its_bucket_boundary() {
        for interval in [1, 7, 60, 300] {
            let ticks = sample_ticks();
            let candles = bulk(ticks.clone(), interval).candles.unwrap();
            for t in &ticks {
                let expected = (t.time as f64 / interval as f64).floor() as i64 * interval;
                assert!(candles.iter().any(|c| c.bucket_start == expected));
            }
            assert!(candles.iter().all(|c| c.bucket_start % interval == 0));
        }
    }

    #[test]
    fn two_ticks_in_one_minute_make_one_candle() {
        let ticks = vec![
            tick(0, dec!(1.0), dec!(1.1), dec!(0.9), dec!(1.0), dec!(10)),
            tick(30, dec!(1.0), dec!(1.2), dec!(0.95), dec!(1.1), dec!(5)),
        ];
        let candles = bulk(ticks, 60).candles.unwrap();
        assert_eq!(
            candles,
            vec![Candle {
                bucket_start: 0,
                open: dec!(1.0),
                high: dec!(1.2),
                low: dec!(0.9),
                close: dec!(1.1),
                value: dec!(15),
            }]
        );
    }

    #[test]
    fn bulk_output_is_independent_of_arrival_order() {
        let sorted = sample_ticks();
        let mut shuffled = sorted.clone();
        shuffled.reverse();
        shuffled.swap(3, 17);
        shuffled.swap(0, 29);
        // duplicate timestamps exercise the stable sort
        shuffled.push(tick(34, dec!(99), dec!(120), dec!(98), dec!(101), dec!(2.5)));

        let mut sorted_with_dup = sorted;
        sorted_with_dup.insert(0, tick(34, dec!(99), dec!(120), dec!(98), dec!(101), dec!(2.5)));

        let a = bulk(sorted_with_dup, 60).candles.unwrap();
        let b = bulk(shuffled, 60).candles.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn bulk_stores_sorted_buffer_with_unique_increasing_buckets() {
        let mut ticks = sample_ticks();
        ticks.reverse();
        let agg = bulk(ticks, 60);
        assert!(agg.buffer.windows(2).all(|w| w[0].time <= w[1].time));
        let candles = agg.candles.unwrap();
        assert!(candles.windows(2).all(|w| w[0].bucket_start < w[1].bucket_start));
    }

    #[test]
    fn incremental_noop_leaves_everything_unchanged() {
        let seeded = bulk(sample_ticks(), 60);
        let last = *seeded.buffer.last().unwrap();
        let replay = tick(last.time, dec!(1), last.high, dec!(1), dec!(1), dec!(1));

        let agg = aggregate(
            seeded.buffer.clone(),
            vec![replay],
            60,
            AggregateMode::Incremental,
            HistoryLimits::default(),
        );
        assert!(!agg.changed);
        assert!(agg.candles.is_none());
        assert_eq!(agg.buffer, seeded.buffer);
    }

    #[test]
    fn incremental_replaces_last_tick_when_high_moves() {
        let base = vec![
            tick(0, dec!(1), dec!(2), dec!(1), dec!(1), dec!(1)),
            tick(10, dec!(1), dec!(2), dec!(1), dec!(1), dec!(1)),
        ];
        let seeded = bulk(base, 60);
        let update = tick(10, dec!(1), dec!(3), dec!(1), dec!(1.5), dec!(4));

        let agg = aggregate(
            seeded.buffer,
            vec![update],
            60,
            AggregateMode::Incremental,
            HistoryLimits::default(),
        );
        assert!(agg.changed);
        assert_eq!(agg.buffer.len(), 2);
        assert_eq!(agg.buffer[1], update);
        let candles = agg.candles.unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, dec!(3));
        assert_eq!(candles[0].value, dec!(5));
    }

    #[test]
    fn incremental_with_newer_time_replaces_last_tick() {
        let seeded = bulk(
            vec![
                tick(0, dec!(1), dec!(2), dec!(1), dec!(1), dec!(1)),
                tick(30, dec!(1), dec!(2), dec!(1), dec!(1), dec!(1)),
            ],
            60,
        );
        let next = tick(60, dec!(1), dec!(2), dec!(1), dec!(1), dec!(7));

        let agg = aggregate(
            seeded.buffer,
            vec![next],
            60,
            AggregateMode::Incremental,
            HistoryLimits::default(),
        );
        assert!(agg.changed);
        assert_eq!(agg.buffer.len(), 2);
        assert_eq!(agg.buffer.last(), Some(&next));
        let starts: Vec<i64> = agg.candles.unwrap().iter().map(|c| c.bucket_start).collect();
        assert_eq!(starts, vec![0, 60]);
    }

    #[test]
    fn older_live_tick_keeps_series_strictly_increasing() {
        let seeded = bulk(
            vec![
                tick(0, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)),
                tick(60, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)),
                tick(120, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1)),
            ],
            60,
        );
        // high differs, time is behind the last buffered tick
        let late = tick(30, dec!(1), dec!(2), dec!(1), dec!(1), dec!(3));

        let agg = aggregate(
            seeded.buffer,
            vec![late],
            60,
            AggregateMode::Incremental,
            HistoryLimits::default(),
        );
        assert!(agg.changed);
        let times: Vec<i64> = agg.buffer.iter().map(|t| t.time).collect();
        assert_eq!(times, vec![0, 30, 60]);

        let candles = agg.candles.unwrap();
        let starts: Vec<i64> = candles.iter().map(|c| c.bucket_start).collect();
        assert_eq!(starts, vec![0, 60]);
        assert_eq!(candles[0].high, dec!(2));
        assert_eq!(candles, rebucket(&agg.buffer, 60));
    }

    #[test]
    fn incremental_into_empty_buffer_appends() {
        let t = tick(5, dec!(1), dec!(1), dec!(1), dec!(1), dec!(1));
        let agg = aggregate(
            Vec::new(),
            vec![t],
            60,
            AggregateMode::Incremental,
            HistoryLimits::default(),
        );
        assert!(agg.changed);
        assert_eq!(agg.buffer, vec![t]);
        assert_eq!(agg.candles.unwrap()[0].bucket_start, 0);
    }

    #[test]
    fn anomalous_values_pass_through_unvalidated() {
        let t = tick(0, dec!(1), dec!(1), dec!(1), dec!(1), dec!(-3));
        let candles = bulk(vec![t, t], 60).candles.unwrap();
        assert_eq!(candles[0].value, dec!(-6));
    }

    #[test]
    fn rebucket_coarsens_without_touching_buffer() {
        let agg = bulk(sample_ticks(), 60);
        let coarse = rebucket(&agg.buffer, 300);
        assert!(coarse.len() < agg.candles.as_ref().unwrap().len());
        let total: Decimal = agg.buffer.iter().map(|t| t.volume).sum();
        let coarse_total: Decimal = coarse.iter().map(|c| c.value).sum();
        assert_eq!(total, coarse_total);
    }
}
