//! This node's identity as presented to peers.

use std::sync::Arc;

use clustd_common::Hello;

use crate::config::AppConfig;

/// Own id, advertised address, and the cluster secret
#[derive(Clone)]
pub struct LocalIdentity {
    pub id: String,
    pub remote_address: String,
    secret: Arc<[u8]>,
}

impl LocalIdentity {
    pub fn new(id: impl Into<String>, remote_address: impl Into<String>, secret: &str) -> Self {
        Self {
            id: id.into(),
            remote_address: remote_address.into(),
            secret: Arc::from(secret.as_bytes()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.cluster.id.clone(),
            config.server.remote_address.clone(),
            &config.cluster.secret,
        )
    }

    pub fn secret(&self) -> Arc<[u8]> {
        self.secret.clone()
    }

    /// True if `host` is the address this node advertises
    pub fn is_local_host(&self, host: &str) -> bool {
        host == self.remote_address
    }

    pub fn hello(&self, ticket: u32) -> Hello {
        Hello {
            hello_world: ticket,
            id: self.id.clone(),
            remote_address: self.remote_address.clone(),
        }
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .field("secret", &"<redacted>")
            .finish()
    }
}
