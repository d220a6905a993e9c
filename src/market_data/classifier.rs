// =============================================================================
// Message Classifier - decodes raw frames into a tagged union
// =============================================================================
//
// Inbound text frames are either the literal heartbeat reply or a JSON
// envelope `{ "isFirst": bool, "data": Tick[] }`. The length of `data` decides
// what the frame means, and that decision is made exactly once, here.
// =============================================================================

use serde::Deserialize;
use tracing::debug;

use crate::error::FeedError;
use crate::types::Tick;

/// Keep-alive token sent upstream.
pub const HEARTBEAT_TOKEN: &str = "ping";
/// Reply the upstream sends back for every keep-alive.
pub const HEARTBEAT_REPLY: &str = "pong";

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    /// Backfill / resync batch (more than one tick).
    Bulk(Vec<Tick>),
    /// Live update to the currently forming period (exactly one tick).
    Incremental(Tick),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    is_first: bool,
    data: Vec<Tick>,
}

/// Decode a single raw frame.
///
/// Returns `Ok(None)` for an envelope with no ticks.
pub fn classify(raw: &str) -> Result<Option<Frame>, FeedError> {
    let trimmed = raw.trim();
    if trimmed == HEARTBEAT_REPLY {
        return Ok(Some(Frame::Heartbeat));
    }

    let envelope: Envelope = serde_json::from_str(trimmed)?;
    let Envelope { is_first, mut data } = envelope;

    let frame = match data.len() {
        0 => None,
        1 => data.pop().map(Frame::Incremental),
        n => {
            debug!(ticks = n, is_first, "bulk frame decoded");
            Some(Frame::Bulk(data))
        }
    };
    Ok(frame)
}

/// Stateful front of [`classify`] that drops a payload identical to the
/// previous data payload. Heartbeats never update the remembered payload.
#[derive(Debug, Default)]
pub struct FrameClassifier {
    last_payload: Option<String>,
}

impl FrameClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, raw: &str) -> Result<Option<Frame>, FeedError> {
        if raw.trim() == HEARTBEAT_REPLY {
            return Ok(Some(Frame::Heartbeat));
        }
        if self.last_payload.as_deref() == Some(raw) {
            debug!("duplicate payload discarded");
            return Ok(None);
        }

        let frame = classify(raw)?;
        self.last_payload = Some(raw.to_string());
        Ok(frame)
    }

    /// Forget the remembered payload, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last_payload = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
