// =============================================================================
// Connection Hub - one shared connection per endpoint, reference counted
// =============================================================================
//
// Consumers `acquire` a lease for an endpoint and `release` it when done. The
// first lease spawns the connection task; later leases subscribe to the same
// frame broadcast and state watch. Releasing the last lease signals the task
// to close the socket and exit.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::connection::manager::{run_connection, ConnectionChannels, ConnectionConfig};
use crate::connection::transport::Connector;
use crate::types::ConnectionState;

const FRAME_BROADCAST_CAPACITY: usize = 1_024;

/// A consumer's handle on a shared connection.
pub struct ConnectionLease {
    endpoint: String,
    pub frames: broadcast::Receiver<Arc<str>>,
    pub state: watch::Receiver<ConnectionState>,
}

impl ConnectionLease {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

struct ActiveConnection {
    frames: broadcast::Sender<Arc<str>>,
    state: watch::Receiver<ConnectionState>,
    leases: usize,
    shutdown: watch::Sender<bool>,
}

struct HubInner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    connections: Mutex<HashMap<String, ActiveConnection>>,
    visibility: watch::Sender<bool>,
}

/// Shared registry of market-data connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

impl ConnectionHub {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (visibility, _) = watch::channel(true);
        Self {
            inner: Arc::new(HubInner {
                connector,
                config,
                connections: Mutex::new(HashMap::new()),
                visibility,
            }),
        }
    }

    /// Join the connection for `endpoint`, starting it if this is the first
    /// lease. Must be called from within a Tokio runtime.
    pub fn acquire(&self, endpoint: &str) -> ConnectionLease {
        let mut connections = self.inner.connections.lock();

        if let Some(active) = connections.get_mut(endpoint) {
            active.leases += 1;
            debug!(endpoint = %endpoint, leases = active.leases, "joined shared connection");
            return ConnectionLease {
                endpoint: endpoint.to_string(),
                frames: active.frames.subscribe(),
                state: active.state.clone(),
            };
        }

        let (frames_tx, frames_rx) = broadcast::channel(FRAME_BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        connections.insert(
            endpoint.to_string(),
            ActiveConnection {
                frames: frames_tx.clone(),
                state: state_rx.clone(),
                leases: 1,
                shutdown: shutdown_tx,
            },
        );

        info!(endpoint = %endpoint, "starting shared connection");
        tokio::spawn(run_connection(
            endpoint.to_string(),
            self.inner.connector.clone(),
            self.inner.config,
            ConnectionChannels {
                frames: frames_tx,
                state: state_tx,
                visibility: self.inner.visibility.subscribe(),
                shutdown: shutdown_rx,
            },
        ));

        ConnectionLease {
            endpoint: endpoint.to_string(),
            frames: frames_rx,
            state: state_rx,
        }
    }

    /// Give a lease back. The last release stops the connection.
    pub fn release(&self, lease: ConnectionLease) {
        let removed = {
            let mut connections = self.inner.connections.lock();
            match connections.get_mut(&lease.endpoint) {
                Some(active) if active.leases > 1 => {
                    active.leases -= 1;
                    debug!(endpoint = %lease.endpoint, leases = active.leases, "lease released");
                    None
                }
                Some(_) => connections.remove(&lease.endpoint),
                None => None,
            }
        };

        if let Some(active) = removed {
            info!(endpoint = %lease.endpoint, "last lease released, closing connection");
            active.shutdown.send_replace(true);
        }
    }

    /// Foreground/background signal shared by every connection.
    pub fn set_visible(&self, visible: bool) {
        let previous = self.inner.visibility.send_replace(visible);
        if previous != visible {
            info!(visible, "consumer visibility changed");
        }
    }

    pub fn is_visible(&self) -> bool {
        *self.inner.visibility.borrow()
    }

    pub fn state(&self, endpoint: &str) -> Option<ConnectionState> {
        self.inner
            .connections
            .lock()
            .get(endpoint)
            .map(|active| *active.state.borrow())
    }

    pub fn active_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
