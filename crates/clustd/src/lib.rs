//! # clustd
//!
//! Cluster membership daemon. Nodes dial each other over encrypted
//! WebSocket channels, detect failures with pings, and agree on a single
//! master by smallest id.
//!
//! ## Architecture
//! ```text
//! Server → SecureChannel → Peer → ClusterRegistry → MasterAssignment
//!                              ↘ DriverManager  → trigger(isMaster)
//! ```

pub mod channel;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod identity;
pub mod peer;
pub mod server;

#[cfg(test)]
mod testing;

pub use daemon::DaemonHandle;
