//! The seam between the sync client and the replicated document.
//!
//! The client never looks inside the document. It only needs to:
//! - apply an update received from the wire,
//! - produce a full-state snapshot,
//! - hear about updates as they are applied, together with their origin.
//!
//! Every update applied from the wire is tagged [`UpdateOrigin::Remote`].
//! [`EchoSuppressor`] drops those when they come back through the change
//! listener, so a remote update is never re-sent to the peer it came from.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use thiserror::Error;

/// Where an applied update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOrigin {
    /// A local edit made by the host editor.
    Local,
    /// An update received from the collaboration peer.
    Remote,
}

impl UpdateOrigin {
    /// Origin tag recorded on the document transaction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Replica errors.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("update could not be decoded: {0}")]
    Decode(String),
    #[error("update could not be applied: {0}")]
    Apply(String),
}

/// Callback invoked for every update applied to a replica.
pub type ChangeListener = Arc<dyn Fn(&[u8], UpdateOrigin) + Send + Sync>;

/// The document as seen by the sync client.
///
/// Implementations must make `apply_update` idempotent and insensitive to
/// arrival order; that is what lets the client skip queueing and dedup.
pub trait DocumentReplica: Send + Sync + 'static {
    /// Merge an encoded update into the document.
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), ReplicaError>;

    /// Encode the full document state.
    fn encode_state(&self) -> Vec<u8>;

    /// Register a listener for applied updates. Dropping the returned
    /// guard unregisters it.
    fn on_local_change(&self, listener: ChangeListener) -> ChangeSubscription;
}

struct Registered {
    id: u64,
    listener: ChangeListener,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: Vec<Registered>,
}

/// Listener bookkeeping shared by replica implementations.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; it stays registered while the guard lives.
    pub fn subscribe(&self, listener: ChangeListener) -> ChangeSubscription {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push(Registered { id, listener });
        ChangeSubscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Call every listener with `update`.
    ///
    /// Listeners are invoked outside the lock so they may subscribe or
    /// unsubscribe re-entrantly.
    pub fn notify(&self, update: &[u8], origin: UpdateOrigin) {
        let listeners: Vec<ChangeListener> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.iter().map(|r| r.listener.clone()).collect()
        };
        for listener in listeners {
            listener(update, origin);
        }
    }

    /// Number of live listeners.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop guard for a registered [`ChangeListener`].
#[must_use = "dropping the subscription unregisters the listener"]
pub struct ChangeSubscription {
    id: u64,
    registry: Weak<RwLock<RegistryInner>>,
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            let mut inner = inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.retain(|r| r.id != self.id);
        }
    }
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("id", &self.id)
            .field("attached", &(self.registry.strong_count() > 0))
            .finish()
    }
}

/// Decides which applied updates go back out on the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoSuppressor {
    suppressed: u64,
}

impl EchoSuppressor {
    /// Returns `true` if an update with this origin should be sent.
    pub fn admit(&mut self, origin: UpdateOrigin) -> bool {
        match origin {
            UpdateOrigin::Remote => {
                self.suppressed += 1;
                false
            }
            UpdateOrigin::Local => true,
        }
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (ChangeListener, Arc<Mutex<Vec<(Vec<u8>, UpdateOrigin)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ChangeListener = Arc::new(move |update: &[u8], origin| {
            sink.lock().unwrap().push((update.to_vec(), origin));
        });
        (listener, seen)
    }

    #[test]
    fn test_origin_tags() {
        assert_eq!(UpdateOrigin::Remote.as_str(), "remote");
        assert_eq!(UpdateOrigin::Local.as_str(), "local");
    }

    #[test]
    fn test_registry_notifies_with_origin() {
        let registry = ListenerRegistry::new();
        let (listener, seen) = recording();
        let _sub = registry.subscribe(listener);

        registry.notify(&[1, 2], UpdateOrigin::Local);
        registry.notify(&[3], UpdateOrigin::Remote);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (vec![1, 2], UpdateOrigin::Local));
        assert_eq!(seen[1], (vec![3], UpdateOrigin::Remote));
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let registry = ListenerRegistry::new();
        let (listener, seen) = recording();
        let sub = registry.subscribe(listener);
        assert_eq!(registry.len(), 1);

        drop(sub);
        assert!(registry.is_empty());

        registry.notify(&[1], UpdateOrigin::Local);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = ListenerRegistry::new();
        let (listener, _) = recording();
        let sub = registry.subscribe(listener);
        drop(registry);
        drop(sub);
    }

    #[test]
    fn test_suppressor_drops_remote() {
        let mut suppressor = EchoSuppressor::default();
        assert!(suppressor.admit(UpdateOrigin::Local));
        assert!(!suppressor.admit(UpdateOrigin::Remote));
        assert!(!suppressor.admit(UpdateOrigin::Remote));

        assert_eq!(suppressor.suppressed(), 2);
    }
}
