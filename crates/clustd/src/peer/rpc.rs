//! Request/response correlation for one peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use clustd_common::ClustdError;

type Responder = oneshot::Sender<Result<Value, ClustdError>>;

/// Outstanding requests keyed by a strictly increasing per-peer id
#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Responder>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Responder>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and a slot for its response
    pub fn register(&self) -> PendingRequest<'_> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.entries().insert(id, tx);
        PendingRequest { id, rx, table: self }
    }

    /// Complete a request. Returns false if nothing was waiting on `id`.
    pub fn resolve(&self, id: u64, result: Result<Value, ClustdError>) -> bool {
        match self.entries().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request with `err`
    pub fn fail_all(&self, err: ClustdError) -> usize {
        let drained: Vec<Responder> = self.entries().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }
}

/// A registered request; its slot is released when this is dropped
pub struct PendingRequest<'a> {
    id: u64,
    rx: oneshot::Receiver<Result<Value, ClustdError>>,
    table: &'a PendingRequests,
}

impl PendingRequest<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response with no deadline of its own
    pub async fn response(mut self) -> Result<Value, ClustdError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(ClustdError::Stopped),
        }
    }

    /// Wait for the response or the deadline, whichever comes first
    pub async fn wait(self, timeout: Duration) -> Result<Value, ClustdError> {
        let id = self.id;
        tokio::time::timeout(timeout, self.response())
            .await
            .unwrap_or_else(|_| Err(timed_out(id)))
    }
}

pub(crate) fn timed_out(id: u64) -> ClustdError {
    ClustdError::Timeout(format!("request {} timed out", id))
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let table = PendingRequests::new();
        let first = table.register();
        let second = table.register();
        assert!(second.id() > first.id());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_delivers_data() {
        let table = PendingRequests::new();
        let request = table.register();
        let id = request.id();

        assert!(table.resolve(id, Ok(json!({ "master": "a" }))));
        let value = assert_ok!(request.wait(Duration::from_secs(1)).await);
        assert_eq!(value["master"], "a");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remote_error_rejects() {
        let table = PendingRequests::new();
        let request = table.register();
        table.resolve(request.id(), Err(ClustdError::Remote("failed to process message".into())));
        assert_eq!(
            request.wait(Duration::from_secs(1)).await,
            Err(ClustdError::Remote("failed to process message".into()))
        );
    }

    #[tokio::test]
    async fn test_timeout_frees_slot() {
        let table = PendingRequests::new();
        let request = table.register();
        let id = request.id();

        let err = assert_err!(request.wait(Duration::from_millis(20)).await);
        assert!(matches!(err, ClustdError::Timeout(_)));
        assert!(table.is_empty());

        // a late response finds nothing waiting
        assert!(!table.resolve(id, Ok(Value::Null)));

        // the table keeps serving new requests
        let next = table.register();
        assert!(table.resolve(next.id(), Ok(json!(1))));
        assert_eq!(next.wait(Duration::from_secs(1)).await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_abandoned_response_frees_slot() {
        let table = PendingRequests::new();
        let request = table.register();

        let outer = tokio::time::timeout(Duration::from_millis(20), request.response()).await;
        assert_err!(outer);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_request_frees_slot() {
        let table = PendingRequests::new();
        drop(table.register());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_rejects_with_stopped() {
        let table = PendingRequests::new();
        let a = table.register();
        let b = table.register();

        assert_eq!(table.fail_all(ClustdError::Stopped), 2);
        assert_eq!(a.wait(Duration::from_secs(1)).await, Err(ClustdError::Stopped));
        assert_eq!(b.wait(Duration::from_secs(1)).await, Err(ClustdError::Stopped));
    }
}
