//! Boot sequence and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use clustd_common::MasterAssignment;

use crate::cluster::ClusterRegistry;
use crate::config::AppConfig;
use crate::driver::DriverManager;
use crate::identity::LocalIdentity;
use crate::peer::PeerSequence;
use crate::server;

/// A running node
pub struct DaemonHandle {
    registry: Arc<ClusterRegistry>,
    drivers: Arc<DriverManager>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    /// Bind the configured listener and boot
    pub async fn start(config: AppConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr())
            .await
            .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
        Self::start_with_listener(config, listener).await
    }

    /// Boot on an already-bound listener.
    ///
    /// The listener and event loops start before joining so nodes booting
    /// together can reach each other on their first dial. Fails if the
    /// cluster reports diverging masters.
    pub async fn start_with_listener(config: AppConfig, listener: TcpListener) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let identity = LocalIdentity::from_config(&config);
        let sequence = Arc::new(PeerSequence::new());
        let (registry, cluster_events) = ClusterRegistry::new(
            identity.clone(),
            config.timing,
            config.cluster.machines.clone(),
            sequence.clone(),
        );
        let (drivers, driver_events) = DriverManager::new(identity.clone(), config.timing, sequence);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let local_addr = listener.local_addr().context("Failed to read listener address")?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            registry.clone().run(cluster_events, shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(drivers.clone().run(
            registry.subscribe(),
            driver_events,
            shutdown_tx.subscribe(),
        )));

        let server = server::serve(
            listener,
            identity,
            config.timing,
            registry.clone(),
            drivers.clone(),
            shutdown_tx.subscribe(),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, "Server error");
            }
        }));

        let handle = Self {
            registry,
            drivers,
            shutdown_tx,
            local_addr,
            tasks,
        };

        let elected = handle.elect().await;
        match elected {
            Ok(assignment) => {
                info!(
                    master = %assignment.master_id,
                    is_local = assignment.is_local,
                    "✅ Node {} joined the cluster",
                    handle.registry.local_id()
                );
                Ok(handle)
            }
            Err(e) => {
                handle.shutdown().await;
                Err(e)
            }
        }
    }

    async fn elect(&self) -> Result<MasterAssignment> {
        self.registry.join_all().await;

        let remote = self
            .registry
            .get_remote_master()
            .await
            .context("Cluster reports diverging masters")?;
        let forced = remote.and_then(|peer| peer.id());

        let assignment = self
            .registry
            .assign_master(forced.as_deref())
            .await
            .context("Failed to assign master")?;
        Ok(assignment)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn drivers(&self) -> &Arc<DriverManager> {
        &self.drivers
    }

    /// Master assignments made after this call
    pub fn subscribe(&self) -> broadcast::Receiver<MasterAssignment> {
        self.registry.subscribe()
    }

    /// Stop the listener, the event loops, and every peer
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.registry.stop_all().await;
        self.drivers.stop_all().await;

        for task in self.tasks {
            let _ = task.await;
        }
        info!("👋 Node {} stopped", self.registry.local_id());
    }
}
