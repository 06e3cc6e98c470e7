//! Maps correlation ids back to the caller waiting on them.
//!
//! Every pending request is resolved at most once: by its response frame, by
//! its own deadline, or by [`Correlator::purge_all`] when the connection goes
//! away. After a purge the correlator refuses new registrations, so no caller
//! can be left waiting on a connection that no longer exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::command::CommandResult;
use crate::error::ClientError;

pub type Outcome = Result<CommandResult, ClientError>;

#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    slot: oneshot::Sender<Outcome>,
}

/// Receiving half handed to the caller that registered an id.
#[derive(Debug)]
pub struct PendingHandle {
    id: u64,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<u64, PendingRequest>,
    purged: bool,
}

#[derive(Debug)]
pub struct Correlator {
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, id: u64) -> Result<PendingHandle, ClientError> {
        let mut state = self.state();
        if state.purged {
            return Err(ClientError::ConnectionClosed);
        }
        if state.pending.contains_key(&id) {
            tracing::error!(id, "correlation id registered twice");
            return Err(ClientError::DuplicateId(id));
        }

        let (slot, receiver) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                id,
                created_at: Utc::now(),
                slot,
            },
        );
        Ok(PendingHandle { id, receiver })
    }

    /// Delivers `outcome` to the caller waiting on `id`. Late or duplicate
    /// responses find nothing registered and are dropped.
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(request) = self.state().pending.remove(&id) else {
            tracing::debug!(id, "dropping response for unknown or settled request");
            return false;
        };
        tracing::trace!(
            id,
            elapsed_ms = (Utc::now() - request.created_at).num_milliseconds(),
            "request settled"
        );
        // The caller may have stopped waiting; nothing to do then.
        let _ = request.slot.send(outcome);
        true
    }

    pub fn reject(&self, id: u64, error: ClientError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Fails every pending request with `error` and closes the correlator to
    /// further registrations.
    pub fn purge_all(&self, error: ClientError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state();
            state.purged = true;
            state.pending.drain().map(|(_, request)| request).collect()
        };
        let purged = drained.len();
        for request in drained {
            let _ = request.slot.send(Err(error.clone()));
        }
        if purged > 0 {
            tracing::info!(purged, %error, "purged pending requests");
        }
        purged
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Waits for the outcome of `handle`. With a deadline, expiry rejects
    /// only this id with [`ClientError::Timeout`]; a response that wins the
    /// race is still delivered.
    pub async fn wait(&self, handle: PendingHandle, deadline: Option<Duration>) -> Outcome {
        let PendingHandle { id, mut receiver } = handle;
        if let Some(deadline) = deadline {
            match tokio::time::timeout(deadline, &mut receiver).await {
                Ok(received) => return received.unwrap_or(Err(ClientError::ConnectionClosed)),
                Err(_) => {
                    tracing::warn!(id, ?deadline, "request deadline expired");
                    self.reject(id, ClientError::Timeout(id));
                }
            }
        }
        receiver.await.unwrap_or(Err(ClientError::ConnectionClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_strictly_increasing() {
        let correlator = Correlator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = correlator.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let correlator = Correlator::new();
        let _handle = correlator.register(5).unwrap();
        assert!(matches!(
            correlator.register(5),
            Err(ClientError::DuplicateId(5))
        ));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let correlator = Correlator::new();
        let handle = correlator.register(1).unwrap();

        assert!(correlator.resolve(1, Ok(CommandResult::Success(json!({"ok": true})))));
        assert!(!correlator.resolve(1, Ok(CommandResult::Success(json!(null)))));

        let outcome = correlator.wait(handle, None).await.unwrap();
        assert_eq!(outcome, CommandResult::Success(json!({"ok": true})));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn unknown_id_is_dropped() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(42, Ok(CommandResult::Success(json!(null)))));
    }

    #[tokio::test]
    async fn purge_fails_everyone_and_blocks_new_registrations() {
        let correlator = Correlator::new();
        let first = correlator.register(correlator.next_id()).unwrap();
        let second = correlator.register(correlator.next_id()).unwrap();

        assert_eq!(correlator.purge_all(ClientError::ConnectionClosed), 2);
        assert_eq!(correlator.pending_count(), 0);

        assert!(matches!(
            correlator.wait(first, None).await,
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            correlator.wait(second, None).await,
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            correlator.register(correlator.next_id()),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn deadline_rejects_only_its_own_request() {
        let correlator = Correlator::new();
        let slow = correlator.register(1).unwrap();
        let other = correlator.register(2).unwrap();

        let outcome = correlator
            .wait(slow, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(outcome, Err(ClientError::Timeout(1))));
        assert_eq!(correlator.pending_count(), 1);

        correlator.resolve(2, Ok(CommandResult::Success(json!("done"))));
        assert_eq!(
            correlator.wait(other, None).await.unwrap(),
            CommandResult::Success(json!("done"))
        );
    }
}
