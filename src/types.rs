// =============================================================================
// Shared types used across the candle feed
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One raw price/volume observation as delivered by the market-data feed.
///
/// `time` is in whole seconds. Numeric fields accept JSON numbers or numeric
/// strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

/// An OHLCV summary for one fixed-width time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub bucket_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub value: Decimal,
}

impl Candle {
    /// Open a new bucket seeded from a single tick.
    pub fn seed(bucket_start: i64, tick: &Tick) -> Self {
        Self {
            bucket_start,
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            value: tick.volume,
        }
    }

    /// Fold another tick of the same bucket into this candle.
    ///
    /// `open` keeps the minimum and `close` the maximum seen in the bucket,
    /// not the first/last tick's values. The min-open/max-close rule is kept
    /// deliberately while it awaits product confirmation.
    pub fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.high);
        self.low = self.low.min(tick.low);
        self.close = self.close.max(tick.close);
        self.open = self.open.min(tick.open);
        self.value += tick.volume;
    }

    /// Reinterpret an already-bucketed candle as a tick so that cached history
    /// can be re-bucketed under a different interval.
    pub fn as_tick(&self) -> Tick {
        Tick {
            time: self.bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.value,
        }
    }
}

/// Lifecycle of the shared market-data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Suspended,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Connecting
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
            Self::Suspended => write!(f, "Suspended"),
        }
    }
}
