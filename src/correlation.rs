//! Registry of in-flight requests keyed by correlation id.
//!
//! Every outstanding call owns a [`PendingReply`]; the reply dispatcher
//! resolves it through [`PendingReplies::complete`]. Dropping the guard
//! (completion, timeout or an abandoned caller) removes the registration.
//!
//! Each waiter records the channel session its request went out on, so a
//! session that dies only resolves its own callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// Identifies one channel session of a client
pub type SessionId = u64;

/// What the dispatcher hands to a waiting caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Body of the correlated reply
    Delivered(Vec<u8>),
    /// The reply stream ended without a match
    StreamClosed,
    /// The reply stream failed
    Failed(String),
}

struct Waiter {
    session: SessionId,
    tx: oneshot::Sender<ReplyEvent>,
}

#[derive(Clone, Default)]
pub struct PendingReplies {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a fresh correlation id on a session
    ///
    /// Panics in debug builds if the id is already outstanding.
    pub fn register(&self, correlation_id: impl Into<String>, session: SessionId) -> PendingReply {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        let previous = self
            .waiters
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), Waiter { session, tx });
        debug_assert!(previous.is_none(), "correlation id reused while outstanding");

        PendingReply {
            correlation_id,
            rx,
            registry: self.clone(),
        }
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.lock().unwrap().contains_key(correlation_id)
    }

    /// Resolve a waiter; returns false if nobody waits for this id
    pub fn complete(&self, correlation_id: &str, event: ReplyEvent) -> bool {
        let waiter = self.waiters.lock().unwrap().remove(correlation_id);
        match waiter {
            // The caller may have gone away between lookup and send
            Some(waiter) => waiter.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Resolve every waiter with the same event
    pub fn complete_all(&self, event: ReplyEvent) -> usize {
        let waiters: Vec<_> = self.waiters.lock().unwrap().drain().collect();
        Self::resolve(waiters.into_iter().map(|(_, waiter)| waiter), event)
    }

    /// Resolve the waiters registered on one session, leaving the rest
    pub fn complete_session(&self, session: SessionId, event: ReplyEvent) -> usize {
        let waiters: Vec<_> = {
            let mut waiters = self.waiters.lock().unwrap();
            let ids: Vec<String> = waiters
                .iter()
                .filter(|(_, waiter)| waiter.session == session)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| waiters.remove(id)).collect()
        };
        Self::resolve(waiters.into_iter(), event)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(waiters: impl Iterator<Item = Waiter>, event: ReplyEvent) -> usize {
        let mut count = 0;
        for waiter in waiters {
            let _ = waiter.tx.send(event.clone());
            count += 1;
        }
        count
    }

    fn remove(&self, correlation_id: &str) {
        self.waiters.lock().unwrap().remove(correlation_id);
    }
}

/// A registered waiter; deregisters itself when dropped
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<ReplyEvent>,
    registry: PendingReplies,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply; `None` when the timeout elapses first
    pub async fn wait(&mut self, timeout: Duration) -> Option<ReplyEvent> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(event)) => Some(event),
            // Sender dropped without an event: the dispatcher is gone
            Ok(Err(_)) => Some(ReplyEvent::StreamClosed),
            Err(_) => None,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.remove(&self.correlation_id);
    }
}
