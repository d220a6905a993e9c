pub mod rest;
pub mod ws;

use crate::connection::ConnectionHub;
use crate::pipeline::FeedHandle;

/// Everything the HTTP surface needs: the feed it serves and the hub whose
/// visibility it controls.
pub struct ApiState {
    pub feed: FeedHandle,
    pub hub: ConnectionHub,
}
