//! Driver peers.
//!
//! Drivers are external processes that connect inbound and are told whether
//! this node is the master. They expose no methods of their own; the manager
//! calls `trigger` on them whenever local mastership flips.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use clustd_common::constants::methods;
use clustd_common::{ClustdError, MasterAssignment, TriggerParams};

use crate::channel::{ChannelReader, SecureChannel};
use crate::config::TimingConfig;
use crate::identity::LocalIdentity;
use crate::peer::{Peer, PeerContext, PeerEvent, PeerRole, PeerSequence};

/// Connected drivers keyed by id
pub struct DriverManager {
    ctx: PeerContext,
    drivers: RwLock<HashMap<String, Arc<Peer>>>,
    /// Last local mastership state forwarded to drivers
    is_master: AtomicBool,
}

impl DriverManager {
    pub fn new(
        identity: LocalIdentity,
        timing: TimingConfig,
        sequence: Arc<PeerSequence>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            ctx: PeerContext {
                identity,
                timing,
                sequence,
                events,
            },
            drivers: RwLock::new(HashMap::new()),
            is_master: AtomicBool::new(false),
        });
        (manager, rx)
    }

    pub async fn len(&self) -> usize {
        self.drivers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.drivers.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.drivers.read().await.get(id).cloned()
    }

    /// Bind an inbound driver connection and register it
    pub async fn accept(
        self: &Arc<Self>,
        channel: Arc<SecureChannel>,
        reader: ChannelReader,
    ) -> Result<bool, ClustdError> {
        let driver = Peer::new_remote(&self.ctx, None, PeerRole::Driver);
        driver.start();

        if let Err(err) = driver.init_client(channel, reader).await {
            driver.stop();
            return Err(err);
        }
        Ok(self.register(&driver).await)
    }

    /// Track an open driver and send it the current mastership state.
    ///
    /// A second driver claiming the id of a still-open driver is rejected
    /// and stopped.
    pub async fn register(self: &Arc<Self>, driver: &Arc<Peer>) -> bool {
        let id = match driver.id() {
            Some(id) if driver.is_open() => id,
            _ => {
                warn!(driver = %driver.label(), seq = driver.seq(), "Cannot register a driver that is not open");
                driver.stop();
                return false;
            }
        };

        {
            let mut drivers = self.drivers.write().await;
            match drivers.get(&id) {
                Some(existing) if Arc::ptr_eq(existing, driver) => return true,
                Some(existing) if existing.is_open() => {
                    warn!(driver = %id, seq = driver.seq(), "Driver id already connected, rejecting");
                    driver.stop();
                    return false;
                }
                _ => {}
            }
            if let Some(stale) = drivers.insert(id.clone(), driver.clone()) {
                stale.stop();
            }
        }
        info!(driver = %id, seq = driver.seq(), "🔌 Driver registered");

        let is_master = self.is_master.load(Ordering::SeqCst);
        let manager = self.clone();
        let driver = driver.clone();
        tokio::spawn(async move { manager.trigger(&driver, is_master).await });
        true
    }

    /// Tell one driver whether this node is master. A failing driver is dropped.
    async fn trigger(&self, driver: &Arc<Peer>, is_master: bool) -> bool {
        let result = match serde_json::to_value(TriggerParams { is_master }) {
            Ok(params) => driver.send(methods::TRIGGER, Some(vec![params])).await,
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(_) => {
                debug!(driver = %driver.label(), is_master, "Driver triggered");
                true
            }
            Err(err) => {
                warn!(driver = %driver.label(), error = %err, "Driver trigger failed, dropping driver");
                self.drop_driver(driver).await;
                false
            }
        }
    }

    async fn drop_driver(&self, driver: &Arc<Peer>) {
        driver.stop();
        let Some(id) = driver.id() else { return };
        let mut drivers = self.drivers.write().await;
        if drivers.get(&id).is_some_and(|tracked| Arc::ptr_eq(tracked, driver)) {
            drivers.remove(&id);
        }
    }

    /// Forward an assignment when local mastership flips
    pub async fn on_assignment(&self, assignment: &MasterAssignment) {
        let was_master = self.is_master.swap(assignment.is_local, Ordering::SeqCst);
        if was_master == assignment.is_local {
            return;
        }

        let drivers: Vec<_> = self.drivers.read().await.values().cloned().collect();
        info!(is_master = assignment.is_local, drivers = drivers.len(), "Local mastership changed, triggering drivers");

        future::join_all(drivers.iter().map(|driver| self.trigger(driver, assignment.is_local))).await;
    }

    /// Consume assignments and driver events until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut assignments: broadcast::Receiver<MasterAssignment>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                assignment = assignments.recv() => match assignment {
                    Ok(assignment) => self.on_assignment(&assignment).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Driver manager lagged behind master assignments");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Some(PeerEvent::Closed(driver)) => {
                        info!(driver = %driver.label(), "Driver disconnected");
                        self.drop_driver(&driver).await;
                    }
                    Some(PeerEvent::Opened(_)) => {}
                    None => break,
                },
            }
        }
        debug!("Driver event loop stopped");
    }

    pub async fn stop_all(&self) {
        let drivers: Vec<_> = self.drivers.write().await.drain().map(|(_, d)| d).collect();
        for driver in drivers {
            driver.stop();
        }
    }
}
