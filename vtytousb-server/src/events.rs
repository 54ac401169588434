//! Typed event emitters and refcounted subscriptions
//!
//! An [`Emitter`] is a shared registry of callbacks keyed by an event kind.
//! Components never register on an emitter directly; they go through an
//! [`EventSubscriber`], which refcounts `(event, handler)` pairs so that
//! repeated setup/teardown cycles cannot leak or double-remove listeners,
//! and which can drop every registration it made in one call.
//!
//! Handlers run synchronously on the emitting task and must not block.
//! In practice they forward into an mpsc channel owned by an async task.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Callback invoked with a borrowed event payload
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Build a [`Handler`] from a closure
pub fn handler<T, F>(f: F) -> Handler<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies one registration on an [`Emitter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registry<K, T> {
    next_id: u64,
    listeners: Vec<(ListenerId, K, Handler<T>)>,
}

/// Shared event source; clones refer to the same listener set
pub struct Emitter<K, T> {
    inner: Arc<Mutex<Registry<K, T>>>,
}

impl<K, T> Clone for Emitter<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> Default for Emitter<K, T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 1,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<K, T> fmt::Debug for Emitter<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.inner.lock().listeners.len())
            .finish()
    }
}

impl<K, T> Emitter<K, T>
where
    K: Copy + Eq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event kind
    pub fn on(&self, event: K, handler: Handler<T>) -> ListenerId {
        let mut registry = self.inner.lock();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, event, handler));
        id
    }

    /// Remove a registration; returns false if it was already gone
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.inner.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|(lid, _, _)| *lid != id);
        registry.listeners.len() != before
    }

    /// Deliver a payload to every handler registered for `event`
    ///
    /// Handlers are invoked outside the registry lock, so they may
    /// subscribe or unsubscribe while being called. Returns the number of
    /// handlers invoked.
    pub fn emit(&self, event: K, payload: &T) -> usize {
        let handlers: Vec<Handler<T>> = self
            .inner
            .lock()
            .listeners
            .iter()
            .filter(|(_, k, _)| *k == event)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();

        for h in &handlers {
            h(payload);
        }
        handlers.len()
    }

    /// Number of registrations for an event kind
    pub fn listener_count(&self, event: K) -> usize {
        self.inner
            .lock()
            .listeners
            .iter()
            .filter(|(_, k, _)| *k == event)
            .count()
    }
}

/// Returned by [`EventSubscriber::on`]/[`EventSubscriber::once`]; pass it
/// back to [`EventSubscriber::release`] to drop that one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken<K> {
    key: SubKey<K>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubKey<K> {
    event: K,
    handler: usize,
    once: bool,
}

struct Subscription {
    count: usize,
    listener: ListenerId,
}

type SubMap<K> = Mutex<HashMap<SubKey<K>, Subscription>>;

/// Refcounted view of an [`Emitter`] owned by one component
///
/// Each `(event, handler)` pair maps to exactly one registration on the
/// emitter, no matter how often it is subscribed. Every subscribe call
/// bumps a count; every release drops it, and the registration is removed
/// when the count reaches zero. [`EventSubscriber::off_all`] removes all of
/// this subscriber's registrations without touching anyone else's; it also
/// runs on drop.
pub struct EventSubscriber<K, T>
where
    K: Copy + Eq + Hash,
{
    emitter: Emitter<K, T>,
    subs: Arc<SubMap<K>>,
}

impl<K, T> EventSubscriber<K, T>
where
    K: Copy + Eq + Hash + Send + Sync + 'static,
    T: 'static,
{
    pub fn new(emitter: &Emitter<K, T>) -> Self {
        Self {
            emitter: emitter.clone(),
            subs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe `handler` to `event`
    pub fn on(&self, event: K, handler: Handler<T>) -> SubscriptionToken<K> {
        let key = SubKey {
            event,
            handler: handler_key(&handler),
            once: false,
        };
        let mut subs = self.subs.lock();
        match subs.get_mut(&key) {
            Some(sub) => sub.count += 1,
            None => {
                let listener = self.emitter.on(event, handler);
                subs.insert(key, Subscription { count: 1, listener });
            }
        }
        SubscriptionToken { key }
    }

    /// Subscribe `handler` for a single delivery
    ///
    /// The delivery consumes one reference, so subscribing the same
    /// handler twice with `once` yields two deliveries.
    pub fn once(&self, event: K, handler: Handler<T>) -> SubscriptionToken<K>
    where
        T: Send + Sync,
    {
        let key = SubKey {
            event,
            handler: handler_key(&handler),
            once: true,
        };
        let mut subs = self.subs.lock();
        match subs.get_mut(&key) {
            Some(sub) => sub.count += 1,
            None => {
                let weak: Weak<SubMap<K>> = Arc::downgrade(&self.subs);
                let emitter = self.emitter.clone();
                let proxy: Handler<T> = Arc::new(move |payload: &T| {
                    let Some(subs) = weak.upgrade() else {
                        return;
                    };
                    // Consume the reference before running the handler so a
                    // re-entrant emit cannot deliver it twice.
                    if !decrement(&subs, &emitter, key) {
                        return;
                    }
                    handler(payload);
                });
                let listener = self.emitter.on(event, proxy);
                subs.insert(key, Subscription { count: 1, listener });
            }
        }
        SubscriptionToken { key }
    }

    /// Drop the reference held by `token`
    pub fn release(&self, token: SubscriptionToken<K>) -> bool {
        decrement(&self.subs, &self.emitter, token.key)
    }

    /// Drop one reference of every handler subscribed to `event`
    pub fn off(&self, event: K) {
        let keys: Vec<SubKey<K>> = self
            .subs
            .lock()
            .keys()
            .filter(|k| k.event == event)
            .copied()
            .collect();
        for key in keys {
            decrement(&self.subs, &self.emitter, key);
        }
    }

    /// Drop one reference of `handler` on `event`
    pub fn off_handler(&self, event: K, handler: &Handler<T>) {
        let id = handler_key(handler);
        for once in [false, true] {
            decrement(
                &self.subs,
                &self.emitter,
                SubKey {
                    event,
                    handler: id,
                    once,
                },
            );
        }
    }

    /// Remove every registration made through this subscriber
    pub fn off_all(&self) {
        let drained: Vec<Subscription> = self.subs.lock().drain().map(|(_, s)| s).collect();
        for sub in drained {
            self.emitter.off(sub.listener);
        }
    }

    /// Number of distinct registrations currently held
    pub fn active(&self) -> usize {
        self.subs.lock().len()
    }

    /// Current reference count of a `(event, handler)` pair
    pub fn count(&self, event: K, handler: &Handler<T>) -> usize {
        let id = handler_key(handler);
        self.subs
            .lock()
            .iter()
            .filter(|(k, _)| k.event == event && k.handler == id)
            .map(|(_, s)| s.count)
            .sum()
    }
}

impl<K, T> Drop for EventSubscriber<K, T>
where
    K: Copy + Eq + Hash,
{
    fn drop(&mut self) {
        let drained: Vec<Subscription> = self.subs.lock().drain().map(|(_, s)| s).collect();
        for sub in drained {
            self.emitter.off(sub.listener);
        }
    }
}

impl<K, T> fmt::Debug for EventSubscriber<K, T>
where
    K: Copy + Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("registrations", &self.subs.lock().len())
            .finish()
    }
}

fn handler_key<T>(handler: &Handler<T>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

/// Returns true if a reference was dropped
fn decrement<K, T>(subs: &SubMap<K>, emitter: &Emitter<K, T>, key: SubKey<K>) -> bool
where
    K: Copy + Eq + Hash,
{
    let detached = {
        let mut subs = subs.lock();
        let Some(sub) = subs.get_mut(&key) else {
            return false;
        };
        sub.count -= 1;
        if sub.count == 0 {
            subs.remove(&key).map(|s| s.listener)
        } else {
            None
        }
    };
    if let Some(listener) = detached {
        emitter.off(listener);
    }
    true
}
