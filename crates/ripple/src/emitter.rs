//! Generic multi-key event emitter.
//!
//! Handlers register under a key or as wildcard listeners and are invoked
//! synchronously on the emitting thread. The handler list is snapshotted
//! before dispatch, so a handler may subscribe or unsubscribe re-entrantly
//! without deadlocking.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Registry<K, T> {
    next_id: u64,
    keyed: HashMap<K, Vec<(u64, Handler<T>)>>,
    wildcard: Vec<(u64, Handler<T>)>,
}

impl<K: Eq + Hash, T> Registry<K, T> {
    fn remove(&mut self, id: u64) {
        for handlers in self.keyed.values_mut() {
            handlers.retain(|(handler_id, _)| *handler_id != id);
        }
        self.wildcard.retain(|(handler_id, _)| *handler_id != id);
    }
}

/// A multi-key event emitter with wildcard support.
///
/// Emission is synchronous: [`EventEmitter::emit`] invokes the handlers
/// registered for the key, then the wildcard handlers, on the calling
/// thread.
pub struct EventEmitter<K, T> {
    registry: Arc<Mutex<Registry<K, T>>>,
}

impl<K, T> EventEmitter<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: 'static,
{
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                keyed: HashMap::new(),
                wildcard: Vec::new(),
            })),
        }
    }

    fn register(&self, key: Option<K>, handler: Handler<T>) -> Subscription {
        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        match key {
            Some(key) => registry.keyed.entry(key).or_default().push((id, handler)),
            None => registry.wildcard.push((id, handler)),
        }
        Subscription::new(Arc::downgrade(&self.registry), id)
    }

    /// Register a handler for events emitted under `key`.
    pub fn on(&self, key: K, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.register(Some(key), Arc::new(handler))
    }

    /// Register a handler for every emitted event.
    pub fn on_all(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.register(None, Arc::new(handler))
    }

    /// Invoke the handlers registered for `key`, then the wildcard handlers.
    pub fn emit(&self, key: &K, value: &T) {
        let handlers: Vec<Handler<T>> = {
            let registry = self.registry.lock().unwrap();
            let keyed = registry
                .keyed
                .get(key)
                .into_iter()
                .flatten()
                .map(|(_, handler)| Arc::clone(handler));
            let wildcard = registry
                .wildcard
                .iter()
                .map(|(_, handler)| Arc::clone(handler));
            keyed.chain(wildcard).collect()
        };
        for handler in handlers {
            handler(value);
        }
    }
}

impl<K, T> Default for EventEmitter<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for a registered listener.
///
/// Call [`Subscription::unsubscribe`] to deregister; dropping the handle
/// leaves the listener registered for the emitter's lifetime.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new<K, T>(registry: Weak<Mutex<Registry<K, T>>>, id: u64) -> Self
    where
        K: Eq + Hash + Send + 'static,
        T: 'static,
    {
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().unwrap().remove(id);
                }
            })),
        }
    }

    /// Remove the listener. Subsequent emissions will not reach it.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
