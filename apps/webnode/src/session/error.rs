use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid socket url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid handshake request: {0}")]
    Request(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket handshake failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("websocket read failed: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("websocket write failed: {0}")]
    Write(#[source] tungstenite::Error),
    #[error("websocket write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("failed to encode heartbeat: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session driver stopped unexpectedly: {0}")]
    Driver(String),
}

/// A single inbound frame that could not be understood. Never fatal.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame is not a recognised json message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The service sent a close frame.
    Remote,
    /// The stream ended without a close frame.
    StreamEnded,
    /// Close was requested locally.
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::Remote => "closed by remote",
            CloseReason::StreamEnded => "stream ended",
            CloseReason::Local => "closed locally",
        };
        f.write_str(label)
    }
}
