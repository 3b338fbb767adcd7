//! Cluster membership and master assignment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use clustd_common::constants::methods;
use clustd_common::{ClustdError, MasterAssignment, MasterView};

use super::election::{self, Candidate, Existing, Registration};
use crate::channel::{ChannelReader, SecureChannel};
use crate::config::TimingConfig;
use crate::identity::LocalIdentity;
use crate::peer::{Peer, PeerContext, PeerEvent, PeerRole, PeerSequence};

/// Capacity of the master assignment notification channel
const ASSIGNMENT_CAPACITY: usize = 16;

/// Known cluster peers keyed by id, plus the local peer and current master
pub struct ClusterRegistry {
    ctx: PeerContext,
    local: Arc<Peer>,
    /// Remote peers only; the local peer is never stored here
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    master: watch::Sender<Option<String>>,
    assignments: broadcast::Sender<MasterAssignment>,
    seeds: Vec<String>,
    /// Peers created for seed hosts, kept so shutdown can stop them
    seed_peers: RwLock<Vec<Arc<Peer>>>,
}

impl ClusterRegistry {
    pub fn new(
        identity: LocalIdentity,
        timing: TimingConfig,
        seeds: Vec<String>,
        sequence: Arc<PeerSequence>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = PeerContext {
            identity,
            timing,
            sequence,
            events,
        };
        let (master, _) = watch::channel(None);
        let (assignments, _) = broadcast::channel(ASSIGNMENT_CAPACITY);
        let local = Peer::new_local(&ctx, PeerRole::cluster(master.subscribe()));

        let registry = Arc::new(Self {
            ctx,
            local,
            peers: RwLock::new(HashMap::new()),
            master,
            assignments,
            seeds,
            seed_peers: RwLock::new(Vec::new()),
        });
        (registry, rx)
    }

    /// Stream of master assignments
    pub fn subscribe(&self) -> broadcast::Receiver<MasterAssignment> {
        self.assignments.subscribe()
    }

    pub fn local(&self) -> &Arc<Peer> {
        &self.local
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.identity.id
    }

    /// Id of the current master, if one has been assigned
    pub fn master_id(&self) -> Option<String> {
        self.master.borrow().clone()
    }

    /// Resolve the current master through the map
    pub async fn master(&self) -> Option<Arc<Peer>> {
        let id = self.master_id()?;
        self.get(&id).await
    }

    /// Tracked peer by id. The local id resolves to the local peer.
    pub async fn get(&self, id: &str) -> Option<Arc<Peer>> {
        if id == self.local_id() {
            return Some(self.local.clone());
        }
        self.peers.read().await.get(id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn open_peer_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.is_open()).count()
    }

    fn new_peer(&self, host: Option<String>) -> Arc<Peer> {
        Peer::new_remote(&self.ctx, host, PeerRole::cluster(self.master.subscribe()))
    }

    /// Track an opened peer under its id, optionally dropping `prev_id`.
    ///
    /// Returns whether the peer is registered afterwards. Rejected peers are
    /// stopped.
    pub async fn register(&self, peer: &Arc<Peer>, prev_id: Option<&str>) -> bool {
        let Some(id) = peer.id() else {
            warn!(peer = %peer.label(), seq = peer.seq(), "Cannot register a peer without an id");
            return false;
        };
        if !peer.is_active() {
            debug!(peer = %id, seq = peer.seq(), "Skipping registration of inactive peer");
            return false;
        }

        let mut peers = self.peers.write().await;

        if let Some(prev) = prev_id.filter(|prev| *prev != id) {
            if let Some(old) = peers.remove(prev) {
                if !Arc::ptr_eq(&old, peer) {
                    old.stop();
                }
            }
        }

        let existing = if id == self.local_id() {
            Some(Existing {
                same: false,
                local: true,
                open: true,
            })
        } else {
            peers.get(&id).map(|tracked| Existing {
                same: Arc::ptr_eq(tracked, peer),
                local: tracked.is_local(),
                open: tracked.is_open(),
            })
        };

        let outcome = election::registration(existing);
        match outcome {
            Registration::Track => {
                peers.insert(id.clone(), peer.clone());
                info!(peer = %id, seq = peer.seq(), host = %peer.host(), "Registered cluster peer");
            }
            Registration::AlreadyTracked => {}
            Registration::Replace => {
                if let Some(stale) = peers.insert(id.clone(), peer.clone()) {
                    stale.stop();
                }
                info!(peer = %id, seq = peer.seq(), "Replaced stale cluster peer");
            }
            Registration::RejectLocal => {
                warn!(peer = %id, seq = peer.seq(), "Peer claims the local id, rejecting");
                peer.stop();
            }
            Registration::RejectOpen => {
                warn!(peer = %id, seq = peer.seq(), "Peer already connected, dropping duplicate connection");
                peer.stop();
            }
        }
        outcome.accepted()
    }

    /// Pick and publish the master.
    ///
    /// A forced id must be the local id or a tracked peer. Otherwise the
    /// smallest id among the local peer and every active, open tracked peer
    /// wins.
    pub async fn assign_master(&self, forced: Option<&str>) -> Result<MasterAssignment, ClustdError> {
        let peers = self.peers.read().await;

        let master_id = match forced {
            Some(id) if id == self.local_id() || peers.contains_key(id) => id.to_string(),
            Some(id) => {
                return Err(ClustdError::Consistency(format!("master {} is not a tracked peer", id)));
            }
            None => {
                let local = Candidate {
                    id: self.local_id().to_string(),
                    active: true,
                    open: true,
                };
                let remotes = peers.iter().map(|(id, peer)| Candidate {
                    id: id.clone(),
                    active: peer.is_active(),
                    open: peer.is_open(),
                });
                election::elect(std::iter::once(local).chain(remotes))
                    .ok_or_else(|| ClustdError::Consistency("no master candidates".into()))?
            }
        };

        for (id, peer) in peers.iter() {
            peer.role().set_master(*id == master_id);
        }
        let is_local = master_id == self.local_id();
        self.local.role().set_master(is_local);

        self.master.send_replace(Some(master_id.clone()));
        let assignment = MasterAssignment { master_id, is_local };
        let _ = self.assignments.send(assignment.clone());

        info!(master = %assignment.master_id, is_local, "👑 Master assigned");
        Ok(assignment)
    }

    /// Dial every seed host concurrently and register the initial successes.
    ///
    /// Unreachable seeds keep reconnecting in the background and register
    /// through the event loop once they open.
    pub async fn join_all(&self) {
        let attempts = self.seeds.iter().map(|host| {
            let peer = self.new_peer(Some(host.clone()));
            peer.start();
            let connected = peer.schedule_connection(Duration::ZERO, true);
            async move {
                let result = connected
                    .await
                    .unwrap_or(Err(ClustdError::Stopped));
                (peer, result)
            }
        });
        let results = future::join_all(attempts).await;

        for (peer, result) in results {
            match result {
                Ok(()) if peer.is_open() => {
                    self.register(&peer, None).await;
                }
                Ok(()) => {}
                Err(err) => {
                    warn!(host = %peer.host(), seq = peer.seq(), error = %err, "Initial connection to seed failed");
                }
            }
            self.seed_peers.write().await.push(peer);
        }

        info!(seeds = self.seeds.len(), open = self.open_peer_count().await, "Cluster join finished");
    }

    /// Ask every tracked peer for its master and agree on one.
    ///
    /// Peers that fail to answer are skipped. Diverging answers are a
    /// split-brain and fail with `Consistency`.
    pub async fn get_remote_master(&self) -> Result<Option<Arc<Peer>>, ClustdError> {
        let peers = self.peers().await;
        if peers.is_empty() {
            return Ok(None);
        }

        let queries = peers.iter().map(|peer| async move {
            let answer = peer
                .send(methods::GET_MASTER, None)
                .await
                .and_then(|data| Ok(serde_json::from_value::<MasterView>(data)?));
            (peer.label(), answer)
        });
        let answers = future::join_all(queries).await;

        let mut views = Vec::with_capacity(answers.len());
        for (label, answer) in answers {
            match answer {
                Ok(view) => views.push((label, view.master)),
                Err(err) => warn!(peer = %label, error = %err, "Peer failed to report its master"),
            }
        }

        let tracked = self.peers.read().await;
        let is_known = |id: &str| id == self.local_id() || tracked.contains_key(id);
        let agreed = election::reconcile(
            views.iter().map(|(label, master)| (label.as_str(), master.as_deref())),
            is_known,
        )?;

        Ok(agreed.and_then(|id| {
            if id == self.local_id() {
                Some(self.local.clone())
            } else {
                tracked.get(&id).cloned()
            }
        }))
    }

    /// Bind an inbound cluster connection to a new peer and register it
    pub async fn accept(&self, channel: Arc<SecureChannel>, reader: ChannelReader) -> Result<bool, ClustdError> {
        let peer = self.new_peer(None);
        peer.start();

        if let Err(err) = peer.init_client(channel, reader).await {
            peer.stop();
            return Err(err);
        }
        Ok(self.register(&peer, None).await)
    }

    async fn on_closed(&self, peer: &Arc<Peer>) {
        if !peer.is_master() {
            return;
        }
        warn!(peer = %peer.label(), "Master connection lost, re-electing");
        if let Err(err) = self.assign_master(None).await {
            error!(error = %err, "Failed to re-elect master");
        }
    }

    /// Consume peer events until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Some(PeerEvent::Opened(peer)) => {
                        self.register(&peer, None).await;
                    }
                    Some(PeerEvent::Closed(peer)) => self.on_closed(&peer).await,
                    None => break,
                },
            }
        }
        debug!("Cluster event loop stopped");
    }

    /// Stop every remote peer
    pub async fn stop_all(&self) {
        let tracked: Vec<_> = self.peers.write().await.drain().map(|(_, peer)| peer).collect();
        let seeds: Vec<_> = self.seed_peers.write().await.drain(..).collect();
        for peer in tracked.iter().chain(seeds.iter()) {
            peer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    use clustd_common::PeerKind;

    use crate::testing::test_timing;

    fn registry(id: &str, seeds: Vec<String>) -> (Arc<ClusterRegistry>, mpsc::UnboundedReceiver<PeerEvent>) {
        let identity = LocalIdentity::new(id, format!("ws://{}.invalid:1", id), "secret");
        ClusterRegistry::new(identity, test_timing(), seeds, Arc::new(PeerSequence::new()))
    }

    /// Registry `b` accepting cluster connections on a real socket
    async fn remote(id: &str) -> (Arc<ClusterRegistry>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("ws://{}", listener.local_addr().unwrap());
        let identity = LocalIdentity::new(id, host.clone(), "secret");
        let (registry, events) =
            ClusterRegistry::new(identity.clone(), test_timing(), Vec::new(), Arc::new(PeerSequence::new()));

        let (_shutdown_tx, shutdown) = broadcast::channel(1);
        tokio::spawn(registry.clone().run(events, shutdown));
        let accepting = registry.clone();
        tokio::spawn(async move {
            let _shutdown_tx = _shutdown_tx;
            while let Ok((stream, _)) = listener.accept().await {
                let registry = accepting.clone();
                let identity = identity.clone();
                tokio::spawn(async move {
                    if let Ok((meta, channel, reader)) = SecureChannel::accept(stream, &identity).await {
                        assert_eq!(meta.kind, PeerKind::Cluster);
                        let _ = registry.accept(channel, reader).await;
                    }
                });
            }
        });
        registry.assign_master(None).await.unwrap();
        (registry, host)
    }

    #[tokio::test]
    async fn test_self_election_without_peers() {
        let (registry, _events) = registry("a", Vec::new());
        let mut notifications = registry.subscribe();

        assert_eq!(registry.get_remote_master().await.unwrap().map(|p| p.label()), None);
        let assignment = registry.assign_master(None).await.unwrap();
        assert_eq!(assignment, MasterAssignment { master_id: "a".into(), is_local: true });
        assert_eq!(notifications.recv().await.unwrap(), assignment);
        assert!(registry.local().is_master());
        assert_eq!(registry.master_id().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_forced_unknown_master_is_consistency_error() {
        let (registry, _events) = registry("a", Vec::new());
        let err = registry.assign_master(Some("z")).await.unwrap_err();
        assert!(matches!(err, ClustdError::Consistency(_)));
        assert_eq!(registry.master_id(), None);
    }

    #[tokio::test]
    async fn test_unbound_peer_is_not_registered() {
        let (registry, _events) = registry("a", Vec::new());
        let peer = registry.new_peer(Some("ws://elsewhere:1".into()));
        peer.start();
        assert!(!registry.register(&peer, None).await);
        assert!(registry.peers().await.is_empty());
        peer.stop();
    }

    #[tokio::test]
    async fn test_join_adopts_remote_master() {
        let (b, host) = remote("b").await;
        let (a, _events) = registry("a", vec![host]);

        a.join_all().await;
        assert_eq!(a.open_peer_count().await, 1);

        let master = a.get_remote_master().await.unwrap().unwrap();
        assert_eq!(master.id().as_deref(), Some("b"));

        let assignment = a.assign_master(master.id().as_deref()).await.unwrap();
        assert!(!assignment.is_local);
        assert!(a.get("b").await.unwrap().is_master());
        assert!(!a.local().is_master());

        // self-election ignores the forced answer and picks the smallest id
        assert_eq!(a.assign_master(None).await.unwrap().master_id, "a");

        a.stop_all().await;
        b.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_open_connection_rejected() {
        let (b, host) = remote("b").await;
        let (a, _events) = registry("a", vec![host.clone()]);
        a.join_all().await;
        let tracked = a.get("b").await.unwrap();

        let duplicate = a.new_peer(Some(host));
        duplicate.start();
        duplicate.schedule_connection(Duration::ZERO, true).await.unwrap().unwrap();
        assert!(!a.register(&duplicate, None).await);
        assert!(!duplicate.is_active());
        assert!(Arc::ptr_eq(&a.get("b").await.unwrap(), &tracked));

        a.stop_all().await;
        b.stop_all().await;
    }

    #[tokio::test]
    async fn test_closed_record_is_replaced() {
        let (b, host) = remote("b").await;
        let (a, _events) = registry("a", vec![host.clone()]);
        a.join_all().await;
        let stale = a.get("b").await.unwrap();
        stale.stop();

        let fresh = a.new_peer(Some(host));
        fresh.start();
        fresh.schedule_connection(Duration::ZERO, true).await.unwrap().unwrap();
        assert!(!stale.is_open());
        assert!(a.register(&fresh, None).await);
        assert!(Arc::ptr_eq(&a.get("b").await.unwrap(), &fresh));
        assert!(a.register(&fresh, None).await);

        a.stop_all().await;
        b.stop_all().await;
    }

    #[tokio::test]
    async fn test_register_with_previous_id_drops_old_record() {
        let (b, host_b) = remote("b").await;
        let (c, host_c) = remote("c").await;
        let (a, _events) = registry("a", vec![host_b]);
        a.join_all().await;
        let old = a.get("b").await.unwrap();
        assert!(old.is_open());

        let renamed = a.new_peer(Some(host_c));
        renamed.start();
        renamed.schedule_connection(Duration::ZERO, true).await.unwrap().unwrap();
        assert_eq!(renamed.id().as_deref(), Some("c"));

        assert!(a.register(&renamed, Some("b")).await);
        assert!(!old.is_active());
        assert!(!old.is_open());
        assert!(a.get("b").await.is_none());
        assert!(Arc::ptr_eq(&a.get("c").await.unwrap(), &renamed));
        assert_eq!(a.peers().await.len(), 1);

        a.stop_all().await;
        b.stop_all().await;
        c.stop_all().await;
    }

    #[tokio::test]
    async fn test_master_loss_triggers_reelection() {
        let (b, host) = remote("b").await;
        let (a, events) = registry("a", vec![host]);
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        tokio::spawn(a.clone().run(events, shutdown));

        a.join_all().await;
        a.assign_master(Some("b")).await.unwrap();
        let mut notifications = a.subscribe();

        b.stop_all().await;
        let assignment = tokio::time::timeout(Duration::from_secs(3), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.master_id, "a");
        assert!(assignment.is_local);

        let _ = shutdown_tx.send(());
        a.stop_all().await;
    }
}
