// Session change notifications
//
// An explicit publish/subscribe registry. Each subscriber gets its own
// unbounded channel so every change is delivered in order; dropping or
// unsubscribing a `Subscription` removes it from the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

use super::types::Credential;

/// What subscribers receive: the session after the change
pub type SessionSnapshot = Option<Arc<Credential>>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<SessionSnapshot>>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.remove(&id);
    }
}

/// Broadcasts "current session changed" to registered subscribers
#[derive(Clone, Default)]
pub struct SessionNotifier {
    registry: Arc<Registry>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. `current` is delivered first so a new
    /// subscriber never has to wait for the next change to learn the state.
    pub fn subscribe(&self, current: SessionSnapshot) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, send cannot fail
        let _ = tx.send(current);

        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        tracing::debug!(subscriber = id, "Session subscriber registered");

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver a change to every live subscriber
    pub fn publish(&self, snapshot: SessionSnapshot) {
        let mut subscribers = self
            .registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        subscribers.retain(|id, tx| {
            let delivered = tx.send(snapshot.clone()).is_ok();
            if !delivered {
                tracing::debug!(subscriber = id, "Pruning closed session subscriber");
            }
            delivered
        });
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A live registration with the notifier
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionSnapshot>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Wait for the next snapshot. `None` once the notifier is gone.
    pub async fn next(&mut self) -> Option<SessionSnapshot> {
        self.rx.recv().await
    }

    /// Take an already-delivered snapshot without waiting
    pub fn try_next(&mut self) -> Option<SessionSnapshot> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving changes
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
            tracing::debug!(subscriber = self.id, "Session subscriber removed");
        }
    }
}
