//! Shared fixtures for unit tests.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::TimingConfig;
use crate::identity::LocalIdentity;
use crate::peer::{PeerContext, PeerEvent, PeerSequence};

/// Short timings so failure paths resolve quickly
pub fn test_timing() -> TimingConfig {
    TimingConfig {
        ping_interval_ms: 200,
        request_timeout_ms: 1000,
        handshake_timeout_ms: 1000,
        reconnect_delay_ms: 100,
    }
}

pub fn test_context(id: &str, remote_address: &str) -> (PeerContext, mpsc::UnboundedReceiver<PeerEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let ctx = PeerContext {
        identity: LocalIdentity::new(id, remote_address, "secret"),
        timing: test_timing(),
        sequence: Arc::new(PeerSequence::new()),
        events,
    };
    (ctx, rx)
}
