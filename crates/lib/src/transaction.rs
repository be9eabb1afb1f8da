//! In-flight transaction tracking for the command channel.
//!
//! Each pending request owns a single-assignment completion slot: it is
//! fulfilled at most once, either by a matching reply or by the deadline
//! sweep. A reply that loses the race against its deadline is dropped.

use crate::error::{ClientError, Result};
use crate::protocol::GatewayResponse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Pending requests keyed by transaction id.
pub struct TransactionRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<GatewayResponse>>>,
}

/// Wait side of one pending transaction.
pub struct WaitHandle {
    id: String,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<GatewayResponse>,
}

impl WaitHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Non-blocking check for an already-delivered response.
    pub fn try_resolved(&mut self) -> Option<GatewayResponse> {
        self.rx.try_recv().ok()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<GatewayResponse>>> {
        // The map stays consistent across a panic; recover instead of poisoning.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pending transaction that must resolve within `timeout`.
    pub fn register(&self, id: &str, timeout: Duration) -> Result<WaitHandle> {
        let mut pending = self.lock();
        if pending.contains_key(id) {
            return Err(ClientError::DuplicateTransaction(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        log::debug!("registered transaction {} ({} pending)", id, pending.len());
        Ok(WaitHandle {
            id: id.to_string(),
            deadline: Instant::now() + timeout,
            timeout,
            rx,
        })
    }

    /// Fulfill a pending transaction. An unknown id (stale or duplicate
    /// reply) is a logged no-op.
    pub fn resolve(&self, response: GatewayResponse) {
        let waiter = self.lock().remove(&response.transaction);
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    log::debug!("transaction waiter dropped before delivery");
                }
            }
            None => log::debug!("ignoring reply for unknown transaction {}", response.transaction),
        }
    }

    /// Drop a pending transaction without resolving it (e.g. its write
    /// failed), leaving no residue behind.
    pub fn abandon(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Suspend until the transaction resolves or its deadline passes.
    ///
    /// On deadline the entry is removed first, so a later reply cannot
    /// resolve an already-timed-out slot. A resolve racing the deadline wins:
    /// if the entry is already gone, the slot is checked once more and its
    /// response returned instead of `Timeout`.
    pub async fn await_resolution(&self, handle: &mut WaitHandle) -> Result<GatewayResponse> {
        match tokio::time::timeout_at(handle.deadline, &mut handle.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::Connection(
                "transaction abandoned before a response arrived".to_string(),
            )),
            Err(_elapsed) => {
                if self.lock().remove(&handle.id).is_some() {
                    Err(ClientError::Timeout(handle.timeout))
                } else {
                    match handle.rx.try_recv() {
                        Ok(response) => Ok(response),
                        Err(_) => Err(ClientError::Timeout(handle.timeout)),
                    }
                }
            }
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn pending_len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseStatus;
    use serde_json::Map;

    fn response_for(id: &str) -> GatewayResponse {
        GatewayResponse {
            transaction: id.to_string(),
            status: ResponseStatus::Success,
            payload: Map::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn resolve_fulfills_the_registered_handle() {
        let registry = TransactionRegistry::new();
        let mut handle = registry.register("t1", Duration::from_secs(1)).unwrap();

        registry.resolve(response_for("t1"));
        let response = registry.await_resolution(&mut handle).await.unwrap();
        assert_eq!(response.transaction, "t1");
        assert_eq!(registry.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = TransactionRegistry::new();
        let _handle = registry.register("t1", Duration::from_secs(1)).unwrap();

        let duplicate = registry.register("t1", Duration::from_secs(1));
        assert!(matches!(
            duplicate,
            Err(ClientError::DuplicateTransaction(_))
        ));
        assert_eq!(registry.pending_len(), 1);
    }

    #[tokio::test]
    async fn resolve_of_unknown_id_is_a_no_op() {
        let registry = TransactionRegistry::new();
        let _handle = registry.register("t1", Duration::from_secs(1)).unwrap();

        registry.resolve(response_for("stale"));
        assert_eq!(registry.pending_len(), 1);
        assert!(registry.is_pending("t1"));
    }

    #[tokio::test]
    async fn deadline_removes_the_entry_and_late_resolve_is_ignored() {
        let registry = TransactionRegistry::new();
        let mut handle = registry.register("t1", Duration::from_millis(20)).unwrap();

        let outcome = registry.await_resolution(&mut handle).await;
        assert!(matches!(outcome, Err(ClientError::Timeout(_))));
        assert_eq!(registry.pending_len(), 0);

        // The slot is gone; a late reply has nowhere to land.
        registry.resolve(response_for("t1"));
        assert_eq!(registry.pending_len(), 0);
    }

    #[tokio::test]
    async fn distinct_ids_resolve_independently_of_order() {
        let registry = TransactionRegistry::new();
        let mut first = registry.register("t1", Duration::from_secs(1)).unwrap();
        let mut second = registry.register("t2", Duration::from_secs(1)).unwrap();

        registry.resolve(response_for("t2"));
        registry.resolve(response_for("t1"));

        let second = registry.await_resolution(&mut second).await.unwrap();
        let first = registry.await_resolution(&mut first).await.unwrap();
        assert_eq!(second.transaction, "t2");
        assert_eq!(first.transaction, "t1");
    }

    #[tokio::test]
    async fn abandon_leaves_no_residue() {
        let registry = TransactionRegistry::new();
        let _handle = registry.register("t1", Duration::from_secs(1)).unwrap();

        registry.abandon("t1");
        assert_eq!(registry.pending_len(), 0);
    }
}
