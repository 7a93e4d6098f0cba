/// Error types for the conversation sync engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Push channel could not be (re)established. Absorbed by the reconnect loop.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A single inbound event was rejected by the dispatcher.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Both the push path and the fallback write failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Backend did not confirm a read-state change. Soft; the change stays applied locally.
    #[error("Read state sync failed for {message_id}: {reason}")]
    ReadStateSyncFailed { message_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Empty peer id, or the local user addressed as a peer.
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Push channel not connected")]
    NotConnected,

    #[error("Engine is not running")]
    EngineStopped,

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Soft errors are logged by callers but never interrupt the engine.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SyncError::TransportUnavailable(_)
                | SyncError::MalformedMessage(_)
                | SyncError::ReadStateSyncFailed { .. }
        )
    }
}

impl From<hyper::Error> for SyncError {
    fn from(e: hyper::Error) -> Self {
        SyncError::Http(e.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for SyncError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        SyncError::Http(e.to_string())
    }
}

impl From<http::Error> for SyncError {
    fn from(e: http::Error) -> Self {
        SyncError::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
