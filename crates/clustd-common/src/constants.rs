//! Shared constants for clustd components.

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Heartbeat ping interval (milliseconds)
pub const PING_INTERVAL_MS: u64 = 1500;

/// RPC request deadline (milliseconds)
pub const REQUEST_TIMEOUT_MS: u64 = 3000;

/// Handshake deadline once the socket is usable (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default delay before a reconnection attempt (milliseconds)
pub const RECONNECT_DELAY_MS: u64 = 5000;

/// Upper bound for any configured timing (milliseconds)
pub const MAX_TIMING_MS: u64 = 24 * 60 * 60 * 1000;

/// AES-GCM nonce length
pub const IV_LENGTH: usize = 12;

/// AES-GCM authentication tag length
pub const TAG_LENGTH: usize = 16;

/// AES-128 key length taken from the SHA-256 digest
pub const KEY_LENGTH: usize = 16;

/// Request header carrying the encrypted connection metadata
pub const METADATA_HEADER: &str = "metadata";

/// RPC method names
pub mod methods {
    /// Ask a cluster peer for its view of the current master
    pub const GET_MASTER: &str = "get_master";

    /// Tell a driver whether the local node is master
    pub const TRIGGER: &str = "trigger";
}

/// Error strings sent back in RPC responses
pub mod responses {
    pub const UNRECOGNIZED_METHOD: &str = "unrecognized method for this peer";
    pub const PROCESSING_FAILED: &str = "failed to process message";
}
