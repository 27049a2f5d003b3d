//! Transport error types

use thiserror::Error;

/// Errors on the master ↔ slave channel
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("registration rejected: {reason}")]
    Rejected { reason: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out")]
    Timeout,

    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}
