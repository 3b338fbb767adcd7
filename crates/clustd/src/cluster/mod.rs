//! Cluster membership.
//!
//! Implements:
//! - Peer registration keyed by id
//! - Deterministic master election
//! - Remote master reconciliation on join

mod election;
mod registry;

pub use election::{Candidate, Existing, Registration, elect, reconcile, registration};
pub use registry::ClusterRegistry;
