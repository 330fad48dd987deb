/// Error types for the LAN messenger core
use crate::crypto::CryptoError;

/// Errors surfaced by discovery, the connection engine and the group coordinator.
///
/// Transport, protocol and crypto failures are always recoverable: they are logged
/// and handed back to the caller, never allowed to stop a background loop.
#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    /// Connection refused, reset, or any other socket failure
    #[error("transport error: {0}")]
    Transport(String),
    /// A bounded network wait ran out
    #[error("timed out: {0}")]
    Timeout(String),
    /// Malformed frame or unexpected reply type
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Key unwrap or decryption failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// Duplicate group name, unknown group, invalid name
    #[error("state error: {0}")]
    State(String),
    /// Identity could not be loaded or created
    #[error("identity error: {0}")]
    Identity(String),
    /// Persisted state could not be read or written
    #[error("storage error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// True for failures caused by the network rather than by local state.
    pub fn is_transport(&self) -> bool {
        matches!(self, PeerError::Transport(_) | PeerError::Timeout(_))
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Storage(err.to_string())
    }
}

impl From<rcgen::Error> for PeerError {
    fn from(err: rcgen::Error) -> Self {
        PeerError::Identity(format!("certificate generation failed: {}", err))
    }
}
