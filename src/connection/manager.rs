// =============================================================================
// Connection Manager - one long-lived market-data connection
// =============================================================================
//
// Drives a single endpoint through Connecting → Open → (Closing) → Closed,
// with three extra rules on top of a plain read loop:
//
//   - Heartbeat: a keep-alive token goes out every `heartbeat_interval`; if
//     nothing comes back for `heartbeat_timeout` the socket is treated as dead.
//   - Reconnect: fixed backoff, at most `reconnect_attempts` retries in a row.
//     Once exhausted the state is `Closed` until the consumer goes hidden and
//     visible again.
//   - Visibility: while hidden the socket is closed, the state is `Suspended`
//     and no attempt is made, no matter how often the link dropped.
//
// Every state change is published on a `watch` channel.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::transport::{Connector, FrameSocket};
use crate::market_data::classifier::HEARTBEAT_TOKEN;
use crate::types::ConnectionState;

/// Heartbeat and reconnect timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(3),
            reconnect_attempts: 10,
        }
    }
}

/// Channels a connection task reads from and publishes to.
pub struct ConnectionChannels {
    pub frames: broadcast::Sender<Arc<str>>,
    pub state: watch::Sender<ConnectionState>,
    pub visibility: watch::Receiver<bool>,
    pub shutdown: watch::Receiver<bool>,
}

enum SessionEnd {
    Shutdown,
    Hidden,
    Dropped(String),
}

/// Run the connection for `endpoint` until `shutdown` turns `true` (or its
/// sender is dropped).
pub async fn run_connection(
    endpoint: String,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    mut ch: ConnectionChannels,
) {
    let mut failures: u32 = 0;

    loop {
        if *ch.shutdown.borrow() {
            break;
        }

        if !*ch.visibility.borrow() {
            publish(&ch.state, ConnectionState::Suspended, &endpoint);
            tokio::select! {
                _ = wait_for_shutdown(&mut ch.shutdown) => break,
                _ = wait_for(&mut ch.visibility, true) => {
                    info!(endpoint = %endpoint, "consumer visible again, resuming");
                    failures = 0;
                    continue;
                }
            }
        }

        publish(&ch.state, ConnectionState::Connecting, &endpoint);
        let connected = tokio::select! {
            _ = wait_for_shutdown(&mut ch.shutdown) => break,
            _ = wait_for(&mut ch.visibility, false) => continue,
            result = connector.connect(&endpoint) => result,
        };

        match connected {
            Ok(socket) => {
                failures = 0;
                publish(&ch.state, ConnectionState::Open, &endpoint);
                match run_session(socket, &endpoint, &config, &mut ch).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Hidden => continue,
                    SessionEnd::Dropped(reason) => {
                        warn!(endpoint = %endpoint, reason = %reason, "market-data connection dropped");
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "failed to connect to market-data endpoint");
            }
        }

        failures += 1;
        if failures > config.reconnect_attempts {
            warn!(
                endpoint = %endpoint,
                attempts = config.reconnect_attempts,
                "reconnect attempts exhausted"
            );
            publish(&ch.state, ConnectionState::Closed, &endpoint);
            tokio::select! {
                _ = wait_for_shutdown(&mut ch.shutdown) => break,
                // going hidden re-arms the budget on the next visible edge
                _ = wait_for(&mut ch.visibility, false) => continue,
            }
        }

        publish(&ch.state, ConnectionState::Connecting, &endpoint);
        debug!(
            endpoint = %endpoint,
            attempt = failures,
            delay_ms = config.reconnect_interval.as_millis() as u64,
            "waiting before reconnecting"
        );
        tokio::select! {
            _ = wait_for_shutdown(&mut ch.shutdown) => break,
            _ = wait_for(&mut ch.visibility, false) => continue,
            _ = sleep(config.reconnect_interval) => {}
        }
    }

    publish(&ch.state, ConnectionState::Closed, &endpoint);
    info!(endpoint = %endpoint, "market-data connection stopped");
}

async fn run_session(
    mut socket: Box<dyn FrameSocket>,
    endpoint: &str,
    config: &ConnectionConfig,
    ch: &mut ConnectionChannels,
) -> SessionEnd {
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let liveness = sleep(config.heartbeat_timeout);
    tokio::pin!(liveness);

    let end = loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut ch.shutdown) => break SessionEnd::Shutdown,
            _ = wait_for(&mut ch.visibility, false) => break SessionEnd::Hidden,
            _ = heartbeat.tick() => {
                if let Err(e) = socket.send(HEARTBEAT_TOKEN.to_string()).await {
                    break SessionEnd::Dropped(e.to_string());
                }
            }
            _ = &mut liveness => {
                break SessionEnd::Dropped(format!(
                    "no reply within {}s",
                    config.heartbeat_timeout.as_secs()
                ));
            }
            message = socket.recv() => match message {
                Some(Ok(text)) => {
                    liveness.as_mut().reset(Instant::now() + config.heartbeat_timeout);
                    // no subscribers is fine, the frame is simply dropped
                    let _ = ch.frames.send(Arc::from(text));
                }
                Some(Err(e)) if e.is_terminal() => break SessionEnd::Dropped(e.to_string()),
                Some(Err(e)) => warn!(endpoint = %endpoint, error = %e, "market-data read error"),
                None => break SessionEnd::Dropped("stream ended".to_string()),
            },
        }
    };

    if matches!(end, SessionEnd::Shutdown | SessionEnd::Hidden) {
        publish(&ch.state, ConnectionState::Closing, endpoint);
        socket.close().await;
    }
    end
}

fn publish(state: &watch::Sender<ConnectionState>, next: ConnectionState, endpoint: &str) {
    let previous = state.send_replace(next);
    if previous != next {
        info!(endpoint = %endpoint, from = %previous, to = %next, "connection state changed");
    }
}

/// Resolves once `rx` holds `want`. Never resolves if the sender is gone.
async fn wait_for(rx: &mut watch::Receiver<bool>, want: bool) {
    loop {
        if *rx.borrow_and_update() == want {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves once shutdown is requested or its sender is dropped.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
