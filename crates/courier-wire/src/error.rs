//! Errors from the framing and peer-link layer.

use courier_types::{ConnectionError, EnvelopeError};
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Bad node environment: {0}")]
    Environment(String),
}

impl From<WireError> for ConnectionError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => ConnectionError::Io(e),
            WireError::Environment(msg) => ConnectionError::InvalidConfig(msg),
            WireError::HandshakeFailed(msg) => ConnectionError::PeerProcess(msg),
            other => ConnectionError::Framing(other.to_string()),
        }
    }
}
