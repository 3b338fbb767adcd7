//! Inbound listener.
//!
//! Every accepted socket is upgraded to a WebSocket, classified by its
//! encrypted `metadata` header and handed to the cluster registry or the
//! driver manager.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use clustd_common::{ClustdError, PeerKind};

use crate::channel::SecureChannel;
use crate::cluster::ClusterRegistry;
use crate::config::TimingConfig;
use crate::driver::DriverManager;
use crate::identity::LocalIdentity;

/// Accept connections until the shutdown broadcast fires
pub async fn serve(
    listener: TcpListener,
    identity: LocalIdentity,
    timing: TimingConfig,
    registry: Arc<ClusterRegistry>,
    drivers: Arc<DriverManager>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("🚀 clustd listening on {}", addr);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let identity = identity.clone();
                let registry = registry.clone();
                let drivers = drivers.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, remote, &identity, timing, &registry, &drivers).await {
                        warn!(remote = %remote, error = %err, "Inbound connection rejected");
                    }
                });
            }
        }
    }

    info!("Listener on {} stopped", addr);
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    identity: &LocalIdentity,
    timing: TimingConfig,
    registry: &ClusterRegistry,
    drivers: &Arc<DriverManager>,
) -> Result<(), ClustdError> {
    let (meta, channel, reader) = tokio::time::timeout(
        timing.handshake_timeout(),
        SecureChannel::accept(stream, identity),
    )
    .await
    .map_err(|_| ClustdError::Timeout("websocket upgrade".into()))??;

    debug!(remote = %remote, kind = %meta.kind, "Accepted connection");
    let registered = match meta.kind {
        PeerKind::Cluster => registry.accept(channel, reader).await?,
        PeerKind::Driver => drivers.accept(channel, reader).await?,
    };

    if !registered {
        debug!(remote = %remote, kind = %meta.kind, "Connection not registered");
    }
    Ok(())
}
