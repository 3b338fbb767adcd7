//! Per-variant request handling.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::watch;

use clustd_common::constants::methods;
use clustd_common::{ClustdError, MasterView, PeerKind};

/// Capability set of a peer, dispatched by variant
pub enum PeerRole {
    Cluster(ClusterRole),
    /// Drivers expose no inbound methods
    Driver,
}

/// State specific to cluster peers
pub struct ClusterRole {
    master: AtomicBool,
    master_view: watch::Receiver<Option<String>>,
}

impl ClusterRole {
    /// `master_view` follows the registry's current master id
    pub fn new(master_view: watch::Receiver<Option<String>>) -> Self {
        Self {
            master: AtomicBool::new(false),
            master_view,
        }
    }

    fn current_master(&self) -> Option<String> {
        self.master_view.borrow().clone()
    }
}

impl PeerRole {
    pub fn cluster(master_view: watch::Receiver<Option<String>>) -> Self {
        Self::Cluster(ClusterRole::new(master_view))
    }

    pub fn kind(&self) -> PeerKind {
        match self {
            Self::Cluster(_) => PeerKind::Cluster,
            Self::Driver => PeerKind::Driver,
        }
    }

    pub fn is_master(&self) -> bool {
        match self {
            Self::Cluster(role) => role.master.load(Ordering::SeqCst),
            Self::Driver => false,
        }
    }

    pub fn set_master(&self, master: bool) {
        if let Self::Cluster(role) = self {
            role.master.store(master, Ordering::SeqCst);
        }
    }

    /// Handle an inbound RPC. `Ok(None)` means the method is not recognized.
    pub fn on_request(&self, method: &str, _params: Option<&[Value]>) -> Result<Option<Value>, ClustdError> {
        match (self, method) {
            (Self::Cluster(role), methods::GET_MASTER) => {
                let view = MasterView {
                    master: role.current_master(),
                };
                Ok(Some(serde_json::to_value(view)?))
            }
            _ => Ok(None),
        }
    }
}
