// =============================================================================
// Feed Pipeline - event loop + consumer handle
// =============================================================================
//
// One task per feed processes events strictly one at a time:
//
//   1. Inbound frames from the shared connection (classify → aggregate →
//      write-through to the snapshot cache → publish).
//   2. Connection state changes (published as-is).
//   3. The periodic compaction timer.
//   4. Consumer commands: interval change, cache refresh, shutdown.
//
// Consumers only ever see immutable `FeedSnapshot`s through a `watch`
// channel. Commands are queued on an unbounded channel, so no handle method
// blocks its caller. Cache reads and writes are awaited on the store, which
// keeps disk I/O off the runtime workers.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::app_state::{FeedSnapshot, FeedState};
use crate::connection::{ConnectionHub, ConnectionLease};
use crate::error::FeedError;
use crate::market_data::{Frame, FrameClassifier, HistoryLimits};
use crate::snapshot::SnapshotCache;
use crate::types::{Candle, ConnectionState};

/// Static settings for one feed.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub endpoint: String,
    pub interval_seconds: i64,
    pub limits: HistoryLimits,
    pub compaction_interval: Duration,
}

#[derive(Debug)]
enum FeedCommand {
    SetInterval(i64),
    Refresh,
    Shutdown,
}

// =============================================================================
// FeedPipeline - event handlers
// =============================================================================

/// Owns the feed state and reacts to one event at a time.
pub struct FeedPipeline {
    state: FeedState,
    classifier: FrameClassifier,
    cache: SnapshotCache,
}

impl FeedPipeline {
    pub fn new(
        interval_seconds: i64,
        limits: HistoryLimits,
        cache: SnapshotCache,
        publisher: watch::Sender<Arc<FeedSnapshot>>,
    ) -> Self {
        Self {
            state: FeedState::new(interval_seconds, limits, publisher),
            classifier: FrameClassifier::new(),
            cache,
        }
    }

    /// Warm start from the cached snapshot, before any network traffic.
    pub async fn hydrate(&mut self) {
        match self.cache.load().await {
            Ok(candles) if !candles.is_empty() => {
                info!(candles = candles.len(), "hydrated candle series from cache");
                self.seed(&candles);
            }
            Ok(_) => debug!("no cached candles, starting empty"),
            Err(e) => self.record_cache_error(e),
        }
        self.state.publish();
    }

    pub async fn on_frame(&mut self, raw: &str) {
        let frame = match self.classifier.classify(raw) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "dropping malformed frame");
                self.state.push_error("parse", e.to_string());
                return;
            }
        };

        match frame {
            Frame::Heartbeat => trace!("heartbeat reply"),
            Frame::Bulk(ticks) => {
                let count = ticks.len();
                self.state.history.apply_bulk(ticks);
                self.state.is_loading = false;
                debug!(
                    ticks = count,
                    raw_len = self.state.history.raw_len(),
                    candles = self.state.history.candles().len(),
                    "bulk merge aggregated"
                );
                self.persist().await;
                self.state.publish();
            }
            Frame::Incremental(tick) => {
                if self.state.history.apply_incremental(tick) {
                    self.state.is_loading = false;
                    self.state.publish();
                } else {
                    trace!(time = tick.time, "live tick was a no-op");
                }
            }
        }
    }

    /// Frames were skipped because this consumer fell behind the broadcast.
    pub fn on_frames_lagged(&mut self, skipped: u64) {
        warn!(skipped, "feed lagged behind the connection, frames dropped");
        self.classifier.reset();
    }

    pub fn on_connection_state(&mut self, next: ConnectionState) {
        if next == self.state.connection_state {
            return;
        }
        if next == ConnectionState::Open {
            // a fresh connection may legitimately resend the last payload
            self.classifier.reset();
        }
        self.state.connection_state = next;
        self.state.publish();
    }

    pub fn on_set_interval(&mut self, interval_seconds: i64) {
        if interval_seconds <= 0 {
            self.state
                .push_error("interval", FeedError::InvalidInterval(interval_seconds).to_string());
            return;
        }
        if self.state.history.set_interval(interval_seconds) {
            info!(interval_seconds, "candle interval changed");
            self.state.publish();
        }
    }

    /// Re-load the last saved snapshot. Never touches the network.
    pub async fn on_refresh(&mut self) {
        match self.cache.load().await {
            Ok(candles) if !candles.is_empty() => {
                info!(candles = candles.len(), "refreshed candle series from cache");
                self.seed(&candles);
                self.state.last_error = None;
            }
            Ok(_) => debug!("refresh requested but cache is empty"),
            Err(e) => self.record_cache_error(e),
        }
        self.state.publish();
    }

    pub fn on_compaction_tick(&mut self) {
        if self.state.history.compact() {
            self.state.publish();
        }
    }

    fn seed(&mut self, candles: &[Candle]) {
        self.state.history.seed_from_candles(candles);
        self.state.is_loading = false;
    }

    async fn persist(&mut self) {
        let saved = self.cache.save(self.state.history.candles()).await;
        match saved {
            Ok(()) => {
                if self.state.last_error.is_some() {
                    info!("snapshot cache writable again");
                    self.state.last_error = None;
                }
            }
            Err(e) => self.record_cache_error(e),
        }
    }

    fn record_cache_error(&mut self, e: FeedError) {
        warn!(error = %e, "snapshot cache failure, continuing without it");
        let message = e.to_string();
        self.state.push_error("cache", message.clone());
        self.state.last_error = Some(message);
    }
}

// =============================================================================
// FeedHandle - consumer-facing read API
// =============================================================================

/// Cloneable handle to a running feed.
#[derive(Clone)]
pub struct FeedHandle {
    snapshots: watch::Receiver<Arc<FeedSnapshot>>,
    commands: mpsc::UnboundedSender<FeedCommand>,
}

impl FeedHandle {
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.snapshots.clone()
    }

    pub fn candle_series(&self) -> Arc<[Candle]> {
        self.snapshots.borrow().candle_series.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshots.borrow().connection_state
    }

    pub fn interval_seconds(&self) -> i64 {
        self.snapshots.borrow().interval_seconds
    }

    pub fn is_loading(&self) -> bool {
        self.snapshots.borrow().is_loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.snapshots.borrow().last_error.clone()
    }

    /// Re-bucket the existing history at a new width. No network I/O.
    pub fn set_interval(&self, interval_seconds: i64) -> Result<(), FeedError> {
        if interval_seconds <= 0 {
            return Err(FeedError::InvalidInterval(interval_seconds));
        }
        self.send(FeedCommand::SetInterval(interval_seconds))
    }

    /// Re-load the last saved snapshot. Does not reconnect.
    pub fn refresh(&self) -> Result<(), FeedError> {
        self.send(FeedCommand::Refresh)
    }

    /// Stop the feed and release its connection lease.
    pub fn shutdown(&self) {
        let _ = self.commands.send(FeedCommand::Shutdown);
    }

    fn send(&self, command: FeedCommand) -> Result<(), FeedError> {
        self.commands.send(command).map_err(|_| FeedError::Closed)
    }
}

// =============================================================================
// Event loop
// =============================================================================

/// Start the feed task: hydrate from the cache, join the shared connection
/// and process events. Returns immediately; must be called from within a
/// Tokio runtime.
pub fn spawn_feed(
    hub: ConnectionHub,
    settings: FeedSettings,
    cache: SnapshotCache,
) -> (FeedHandle, JoinHandle<()>) {
    let (publisher, snapshots) =
        watch::channel(Arc::new(FeedSnapshot::initial(settings.interval_seconds)));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let mut pipeline =
        FeedPipeline::new(settings.interval_seconds, settings.limits, cache, publisher);

    let task = tokio::spawn(async move {
        pipeline.hydrate().await;
        let lease = hub.acquire(&settings.endpoint);
        run_feed(pipeline, hub, lease, commands_rx, settings.compaction_interval).await;
    });

    (
        FeedHandle {
            snapshots,
            commands: commands_tx,
        },
        task,
    )
}

async fn run_feed(
    mut pipeline: FeedPipeline,
    hub: ConnectionHub,
    mut lease: ConnectionLease,
    mut commands: mpsc::UnboundedReceiver<FeedCommand>,
    compaction_interval: Duration,
) {
    let mut compaction = interval_at(Instant::now() + compaction_interval, compaction_interval);
    compaction.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let initial = *lease.state.borrow_and_update();
    pipeline.on_connection_state(initial);

    let mut frames_open = true;
    let mut state_open = true;

    info!(endpoint = %lease.endpoint(), "feed pipeline running");

    loop {
        tokio::select! {
            frame = lease.frames.recv(), if frames_open => match frame {
                Ok(raw) => pipeline.on_frame(&raw).await,
                Err(RecvError::Lagged(skipped)) => pipeline.on_frames_lagged(skipped),
                Err(RecvError::Closed) => frames_open = false,
            },
            changed = lease.state.changed(), if state_open => match changed {
                Ok(()) => {
                    let next = *lease.state.borrow_and_update();
                    pipeline.on_connection_state(next);
                }
                Err(_) => state_open = false,
            },
            _ = compaction.tick() => pipeline.on_compaction_tick(),
            command = commands.recv() => match command {
                Some(FeedCommand::SetInterval(secs)) => pipeline.on_set_interval(secs),
                Some(FeedCommand::Refresh) => pipeline.on_refresh().await,
                Some(FeedCommand::Shutdown) | None => break,
            },
        }
    }

    hub.release(lease);
    pipeline.on_connection_state(ConnectionState::Closed);
    info!("feed pipeline stopped");
}
