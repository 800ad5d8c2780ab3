//! Listener registries with scoped subscriptions.
//!
//! Every observable piece of the engine (queues, timelines, projections)
//! exposes `register`-style methods returning a [`Subscription`]. The
//! subscription unregisters exactly once: either explicitly through
//! [`Subscription::unsubscribe`] or when it is dropped.
//!
//! Listeners are invoked synchronously, outside of the registry lock, so a
//! listener may push to the queue that notified it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Lock a mutex, recovering the guard if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    entries: BTreeMap<u64, Callback<E>>,
}

/// An ordered set of callbacks for events of type `E`.
pub struct Listeners<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// subscription is dropped or unsubscribed.
    pub fn register(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription::from_fn(move || {
            if let Some(registry) = weak.upgrade() {
                lock(&registry).entries.remove(&id);
            }
        })
    }

    /// Invoke every registered callback in registration order.
    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = lock(&self.registry).entries.values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Teardown handle returned by every `register` call.
///
/// Dropping the subscription unregisters the listener.
#[must_use = "dropping a Subscription unregisters the listener immediately"]
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an arbitrary teardown closure.
    pub fn from_fn(teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Combine several subscriptions into one that tears all of them down.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::from_fn(move || drop(subscriptions))
    }

    /// Unregister now.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}
