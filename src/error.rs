use thiserror::Error;

/// All errors generated by the candle feed pipeline.
///
/// None of these are fatal to the host process: connection errors feed the
/// reconnect policy, parse errors drop the offending frame and cache errors
/// surface as the published `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to parse frame: {0}")]
    Parse(String),

    #[error("snapshot cache error: {0}")]
    Cache(String),

    #[error("invalid candle interval: {0}s")]
    InvalidInterval(i64),

    #[error("feed pipeline has shut down")]
    Closed,
}

impl FeedError {
    /// Determine if an error should tear down the current connection and
    /// hand control to the reconnect policy.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedError::Connection(_))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(value.to_string())
    }
}
