//! Peer lifecycle on top of a secure channel.
//!
//! A [`Peer`] is this process's model of one participant. Remote peers own
//! at most one live channel, ping it on a fixed interval, reconnect while
//! active, and correlate RPC responses by request id. The local peer has no
//! channel and is always considered open.

mod role;
mod rpc;

pub use role::{ClusterRole, PeerRole};
pub use rpc::{PendingRequest, PendingRequests};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use clustd_common::constants::responses;
use clustd_common::{ClustdError, Hello, PeerKind, Request, Response, WireMessage};

use crate::channel::{ChannelEvent, ChannelReader, SecureChannel};
use crate::config::TimingConfig;
use crate::identity::LocalIdentity;

/// Log-correlation numbers handed out to peers at construction
#[derive(Debug, Default)]
pub struct PeerSequence(AtomicU64);

impl PeerSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Lifecycle notifications sent to a peer's owner
pub enum PeerEvent {
    /// A scheduled connection attempt completed its handshake
    Opened(Arc<Peer>),
    /// The attached channel closed
    Closed(Arc<Peer>),
}

/// Everything an owner shares with the peers it creates
#[derive(Clone)]
pub struct PeerContext {
    pub identity: LocalIdentity,
    pub timing: TimingConfig,
    pub sequence: Arc<PeerSequence>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

struct PeerState {
    id: Option<String>,
    host: String,
    active: bool,
    channel: Option<Arc<SecureChannel>>,
    last_pong: Option<Instant>,
    heartbeat: Option<AbortHandle>,
    connect: Option<AbortHandle>,
    connect_epoch: u64,
}

pub struct Peer {
    seq: u64,
    local: bool,
    role: PeerRole,
    identity: LocalIdentity,
    timing: TimingConfig,
    state: Mutex<PeerState>,
    pending: PendingRequests,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Peer {
    /// This process's own identity. Always active, never owns a channel.
    pub fn new_local(ctx: &PeerContext, role: PeerRole) -> Arc<Self> {
        let peer = Self::build(ctx, Some(ctx.identity.id.clone()), ctx.identity.remote_address.clone(), role);
        info!(peer = %ctx.identity.id, seq = peer.seq, "Initialized local peer");
        Arc::new(peer)
    }

    /// A remote participant; `host` is unknown for accepted connections until the handshake
    pub fn new_remote(ctx: &PeerContext, host: Option<String>, role: PeerRole) -> Arc<Self> {
        Arc::new(Self::build(ctx, None, host.unwrap_or_default(), role))
    }

    fn build(ctx: &PeerContext, id: Option<String>, host: String, role: PeerRole) -> Self {
        let local = ctx.identity.is_local_host(&host);
        Self {
            seq: ctx.sequence.next(),
            local,
            role,
            identity: ctx.identity.clone(),
            timing: ctx.timing,
            state: Mutex::new(PeerState {
                id,
                host,
                active: local,
                channel: None,
                last_pong: None,
                heartbeat: None,
                connect: None,
                connect_epoch: 0,
            }),
            pending: PendingRequests::new(),
            events: ctx.events.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> PeerKind {
        self.role.kind()
    }

    pub fn role(&self) -> &PeerRole {
        &self.role
    }

    pub fn id(&self) -> Option<String> {
        self.state().id.clone()
    }

    pub fn host(&self) -> String {
        self.state().host.clone()
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn is_open(&self) -> bool {
        if self.local {
            return true;
        }
        let state = self.state();
        state.active && state.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn is_master(&self) -> bool {
        self.role.is_master()
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Id if known, otherwise host
    pub fn label(&self) -> String {
        let state = self.state();
        state.id.clone().unwrap_or_else(|| state.host.clone())
    }

    /// Activate the peer and start its heartbeat
    pub fn start(self: &Arc<Self>) {
        if self.local {
            return;
        }
        let mut state = self.state();
        if state.active {
            return;
        }
        state.active = true;
        state.heartbeat = Some(self.spawn_heartbeat());
    }

    /// Deactivate, drop the channel, cancel timers, and fail pending requests
    pub fn stop(&self) {
        if self.local {
            return;
        }

        let (channel, timers) = {
            let mut state = self.state();
            state.active = false;
            state.last_pong = None;
            state.connect_epoch += 1;
            (
                state.channel.take(),
                [state.heartbeat.take(), state.connect.take()],
            )
        };

        for timer in timers.into_iter().flatten() {
            timer.abort();
        }
        if let Some(channel) = channel {
            channel.close();
        }

        let failed = self.pending.fail_all(ClustdError::Stopped);
        debug!(peer = %self.label(), seq = self.seq, failed, "Peer stopped");
    }

    fn open_channel(&self) -> Option<Arc<SecureChannel>> {
        let state = self.state();
        if !state.active {
            return None;
        }
        state.channel.clone().filter(|c| c.is_open())
    }

    /// Call `method` on the remote peer and wait for its response.
    ///
    /// The request deadline covers the write as well as the wait.
    pub async fn send(&self, method: &str, params: Option<Vec<Value>>) -> Result<Value, ClustdError> {
        if self.local {
            return Err(ClustdError::Disconnected);
        }
        let channel = self.open_channel().ok_or(ClustdError::Disconnected)?;

        let request = self.pending.register();
        let req_id = request.id();
        let message = Request {
            req_id,
            method: method.to_string(),
            params,
        };
        let exchange = async move {
            if let Err(err) = channel.send(&message, false).await {
                if err.is_fatal_to_channel() {
                    channel.close();
                }
                return Err(err);
            }
            debug!(peer = %self.label(), seq = self.seq, method, req_id, "Sent request");
            request.response().await
        };

        tokio::time::timeout(self.timing.request_timeout(), exchange)
            .await
            .unwrap_or_else(|_| Err(rpc::timed_out(req_id)))
    }

    /// Bind a channel to this peer through the handshake and start consuming it
    pub async fn init_client(
        self: &Arc<Self>,
        channel: Arc<SecureChannel>,
        reader: ChannelReader,
    ) -> Result<(), ClustdError> {
        let verify = |hello: &Hello| self.bind_identity(&channel, hello);
        let outcome = channel
            .init(reader, verify, self.timing.handshake_timeout())
            .await;

        match outcome {
            Ok(events) => {
                info!(peer = %self.label(), seq = self.seq, kind = %self.kind(), "Successfully connected");
                let this = self.clone();
                let attached = channel.clone();
                tokio::spawn(async move { this.run_channel(attached, events).await });
                Ok(())
            }
            Err(err) => {
                error!(peer = %self.label(), seq = self.seq, error = %err, "Handshake failed");
                self.detach(&channel);
                Err(err)
            }
        }
    }

    fn bind_identity(&self, channel: &Arc<SecureChannel>, hello: &Hello) -> Result<(), ClustdError> {
        let mut state = self.state();

        if let Some(id) = &state.id {
            if *id != hello.id {
                return Err(ClustdError::Handshake(format!("id mismatch: {} -> {}", id, hello.id)));
            }
        }
        if hello.id.is_empty() {
            return Err(ClustdError::Handshake("handshake missing id".into()));
        }
        if hello.remote_address.is_empty() {
            return Err(ClustdError::Handshake("handshake missing remote address".into()));
        }
        if self.kind() == PeerKind::Cluster && hello.id == self.identity.id {
            return Err(ClustdError::Handshake(format!("remote claims the local id {}", hello.id)));
        }
        if !state.active {
            return Err(ClustdError::Handshake("peer is not active".into()));
        }
        if let Some(existing) = &state.channel {
            if !Arc::ptr_eq(existing, channel) && existing.is_open() {
                return Err(ClustdError::Handshake("a connection is already open".into()));
            }
        }

        state.id = Some(hello.id.clone());
        state.host = hello.remote_address.clone();
        state.channel = Some(channel.clone());
        state.last_pong = Some(Instant::now());
        Ok(())
    }

    /// Remove `channel` if it is the attached one. Returns whether it was.
    fn detach(&self, channel: &Arc<SecureChannel>) -> bool {
        let mut state = self.state();
        let attached = state.channel.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel));
        if attached {
            state.channel = None;
        }
        attached
    }

    async fn run_channel(
        self: Arc<Self>,
        channel: Arc<SecureChannel>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Ping | ChannelEvent::Pong => {
                    self.state().last_pong = Some(Instant::now());
                }
                ChannelEvent::Message(msg) => self.dispatch(&channel, msg).await,
                ChannelEvent::Closed => break,
            }
        }

        if !self.detach(&channel) {
            return;
        }
        warn!(peer = %self.label(), seq = self.seq, "Connection lost");
        let _ = self.events.send(PeerEvent::Closed(self.clone()));
        if self.is_active() {
            let _ = self.schedule_connection(self.retry_delay(), false);
        }
    }

    async fn dispatch(&self, channel: &Arc<SecureChannel>, msg: WireMessage) {
        match msg {
            WireMessage::Request(req) => {
                let response = match self.role.on_request(&req.method, req.params.as_deref()) {
                    Ok(Some(data)) => Response::data(req.req_id, data),
                    Ok(None) => Response::error(req.req_id, responses::UNRECOGNIZED_METHOD),
                    Err(err) => {
                        error!(peer = %self.label(), method = %req.method, error = %err, "Failed to process request");
                        Response::error(req.req_id, responses::PROCESSING_FAILED)
                    }
                };
                if let Err(err) = channel.send(&response, false).await {
                    error!(peer = %self.label(), error = %err, "Failed to send response");
                }
            }
            WireMessage::Response(res) => {
                let id = res.res_id;
                if !self.pending.resolve(id, res.into_result()) {
                    debug!(peer = %self.label(), res_id = id, "Response for unknown request");
                }
            }
            other => {
                warn!(peer = %self.label(), message = ?other, "Message dropped");
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> AbortHandle {
        let peer: Weak<Self> = Arc::downgrade(self);
        let interval = self.timing.ping_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(peer) = peer.upgrade() else { break };
                if !peer.heartbeat(interval).await {
                    break;
                }
            }
        })
        .abort_handle()
    }

    /// One heartbeat tick. Returns false once the peer is inactive.
    async fn heartbeat(&self, interval: Duration) -> bool {
        let (active, channel, last_pong) = {
            let state = self.state();
            (state.active, state.channel.clone(), state.last_pong)
        };
        if !active {
            return false;
        }
        let Some(channel) = channel else {
            return true;
        };
        if !channel.is_open() {
            warn!(peer = %self.label(), "Attempting to ping a closed peer");
            return true;
        }

        if last_pong.is_some_and(|last| last.elapsed() > interval.saturating_mul(2)) {
            warn!(peer = %self.label(), seq = self.seq, "Pong delta is too great, closing connection");
            channel.close();
            return true;
        }

        if let Err(err) = channel.ping().await {
            debug!(peer = %self.label(), error = %err, "Ping failed");
        }
        true
    }

    /// Configured reconnect delay jittered to 50-150%
    fn retry_delay(&self) -> Duration {
        let base = self.timing.reconnect_delay_ms;
        let jittered = rand::rng().random_range(base / 2..=base.saturating_add(base / 2));
        Duration::from_millis(jittered)
    }

    /// Arm a one-shot connection attempt after `delay`.
    ///
    /// A failed attempt always re-arms itself. Only when `reject_on_fail`
    /// is set does the returned receiver see that first failure.
    pub fn schedule_connection(
        self: &Arc<Self>,
        delay: Duration,
        reject_on_fail: bool,
    ) -> oneshot::Receiver<Result<(), ClustdError>> {
        let (tx, rx) = oneshot::channel();
        if self.local {
            let _ = tx.send(Err(ClustdError::Protocol(
                "only remote peers can schedule connections".into(),
            )));
            return rx;
        }

        let epoch = {
            let mut state = self.state();
            state.connect_epoch += 1;
            state.connect_epoch
        };

        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !this.should_connect(epoch) {
                let _ = tx.send(Ok(()));
                return;
            }

            match this.connect().await {
                Ok(()) => {
                    let _ = this.events.send(PeerEvent::Opened(this.clone()));
                    let _ = tx.send(Ok(()));
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(peer = %this.label(), seq = this.seq, error = %err, "Failed to connect to host");
                    } else {
                        error!(peer = %this.label(), seq = this.seq, error = %err, "Connection attempt rejected");
                    }
                    if this.is_active() {
                        let _ = this.schedule_connection(this.retry_delay(), false);
                    }
                    let _ = tx.send(if reject_on_fail { Err(err) } else { Ok(()) });
                }
            }
        });

        let mut state = self.state();
        if state.connect_epoch == epoch {
            state.connect = Some(task.abort_handle());
        }
        rx
    }

    fn should_connect(&self, epoch: u64) -> bool {
        let state = self.state();
        let open = state.channel.as_ref().is_some_and(|c| c.is_open());
        state.connect_epoch == epoch && state.active && !open
    }

    async fn connect(self: &Arc<Self>) -> Result<(), ClustdError> {
        let host = self.host();
        if host.is_empty() {
            return Err(ClustdError::Transport("peer has no host to dial".into()));
        }
        let (channel, reader) = SecureChannel::dial(
            &host,
            self.kind(),
            &self.identity,
            self.timing.handshake_timeout(),
        )
        .await?;
        self.init_client(channel, reader).await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("seq", &self.seq)
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("host", &self.host())
            .field("local", &self.local)
            .field("open", &self.is_open())
            .finish()
    }
}
