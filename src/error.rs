//! Error taxonomy shared by the hub, its transports and the state cache.
//!
//! Throttled publishes and offline-queue evictions are not errors: they are
//! reported through `HubEvent::Throttled` and a `warn!` log respectively.

use thiserror::Error;

/// Network-layer failure reported by a transport (connect, subscribe or publish).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

#[derive(Debug, Error)]
pub enum MuxError {
    /// Missing or malformed connection parameters. Never retried.
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state cache error: {0}")]
    Cache(String),

    /// Malformed frame on the consumer socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The supervisor task is gone (shut down or panicked).
    #[error("hub is not running")]
    HubClosed,
}

impl From<rusqlite::Error> for MuxError {
    fn from(e: rusqlite::Error) -> Self {
        MuxError::Cache(e.to_string())
    }
}
