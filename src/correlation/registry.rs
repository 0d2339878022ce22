//! Listener registry keyed by message id.
//!
//! # Responsibilities
//! - Register durable (`on`) and one-shot (`once`) listeners per id
//! - Fan a notification out to every listener registered for its id
//! - Remove listeners by identity (`off`) or all at once (`off_all`)
//!
//! # Design Decisions
//! - Registration returns a [`Subscription`] handle; disposing it is idempotent
//! - One-shot listeners carry a "fired" flag flipped under the same shard lock
//!   that removes them, so a listener never fires twice
//! - Callbacks run outside the lock; a panicking listener is logged and skipped

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::protocol::Message;

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identity of one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    once: bool,
    fired: AtomicBool,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    listeners: DashMap<String, Vec<Entry>>,
    next_id: AtomicU64,
}

impl Inner {
    fn off(&self, key: &str, id: ListenerId) -> bool {
        let removed = match self.listeners.get_mut(key) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                before != entries.len()
            }
            None => false,
        };
        self.listeners.remove_if(key, |_, entries| entries.is_empty());
        removed
    }
}

/// Registry of listeners keyed by message id.
#[derive(Clone, Default)]
pub struct NotificationRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("keys", &self.inner.listeners.len())
            .finish()
    }
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that survives every notification until removed.
    pub fn on<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(key, false, Arc::new(callback))
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(key, true, Arc::new(callback))
    }

    /// Remove one listener. Returns false if it was already gone.
    pub fn off(&self, key: &str, id: ListenerId) -> bool {
        self.inner.off(key, id)
    }

    /// Remove every listener for `key`. Returns how many were removed.
    pub fn off_all(&self, key: &str) -> usize {
        self.inner
            .listeners
            .remove(key)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }

    /// Remove every listener for every key.
    pub fn clear(&self) -> usize {
        let total = self.inner.listeners.iter().map(|e| e.value().len()).sum();
        self.inner.listeners.clear();
        total
    }

    /// Deliver `message` to every listener registered under `key`.
    ///
    /// Returns how many listeners were invoked; zero means nobody was waiting.
    pub fn notify(&self, key: &str, message: &Message) -> usize {
        let callbacks: Vec<Callback> = {
            let Some(mut entries) = self.inner.listeners.get_mut(key) else {
                return 0;
            };
            let mut fire = Vec::with_capacity(entries.len());
            entries.retain(|entry| {
                if !entry.once {
                    fire.push(Arc::clone(&entry.callback));
                    return true;
                }
                if !entry.fired.swap(true, Ordering::SeqCst) {
                    fire.push(Arc::clone(&entry.callback));
                }
                false
            });
            fire
        };
        self.inner.listeners.remove_if(key, |_, entries| entries.is_empty());

        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                tracing::warn!(message_id = %key, "Listener panicked during notification");
            }
        }
        callbacks.len()
    }

    /// Number of listeners registered under `key`.
    pub fn listener_count(&self, key: &str) -> usize {
        self.inner.listeners.get(key).map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.listeners.is_empty()
    }

    fn register(&self, key: &str, once: bool, callback: Callback) -> Subscription {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .entry(key.to_string())
            .or_default()
            .push(Entry {
                id,
                once,
                fired: AtomicBool::new(false),
                callback,
            });
        Subscription {
            key: key.to_string(),
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }
}

/// Disposer handle returned by registration.
#[derive(Clone)]
pub struct Subscription {
    key: String,
    id: ListenerId,
    registry: Weak<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the listener. Safe to call any number of times from any thread.
    pub fn dispose(&self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.off(&self.key, self.id),
            None => false,
        }
    }
}
