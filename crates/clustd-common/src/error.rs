//! Common error types for clustd components.

use thiserror::Error;

/// Common errors across clustd components
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClustdError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message authentication or decryption failed
    #[error("message decryption failure, verify the cluster secret")]
    Decrypt,

    /// Handshake failed or identity could not be bound
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Peer violated the channel protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Underlying socket error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Channel has not completed its handshake
    #[error("connection not initialized")]
    NotInitialized,

    /// Channel socket is closed
    #[error("connection closed")]
    Closed,

    /// Peer is not open
    #[error("disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer was stopped while the request was pending
    #[error("stopped")]
    Stopped,

    /// Remote peer reported an error for a request
    #[error("Remote error: {0}")]
    Remote(String),

    /// Cluster state is inconsistent and cannot be reconciled
    #[error("Cluster consistency error: {0}")]
    Consistency(String),
}

impl ClustdError {
    /// Returns true if a later attempt on a fresh connection may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Closed
                | Self::Disconnected
                | Self::Timeout(_)
                | Self::Handshake(_)
        )
    }

    /// Returns true if the error means the channel it came from is unusable
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(self, Self::Decrypt | Self::Protocol(_) | Self::Transport(_))
    }
}

impl From<serde_json::Error> for ClustdError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
