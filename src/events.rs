//! Observer registry with explicit unsubscription.
//!
//! Handlers run synchronously on the emitting task, in subscription order.
//! The registry lock is released before handlers run, so a handler may
//! subscribe or unsubscribe without deadlocking.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<E>>,
}

/// Multi-subscriber event channel.
pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }
}

impl<E: 'static> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. It stays registered until the returned
    /// subscription is explicitly cancelled; dropping the handle does not
    /// unsubscribe.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().expect("event registry mutex poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.insert(id, Arc::new(handler));

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry
                        .lock()
                        .expect("event registry mutex poisoned")
                        .handlers
                        .remove(&id);
                }
            })),
        }
    }

    /// Deliver `event` to every current subscriber.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .registry
            .lock()
            .expect("event registry mutex poisoned")
            .handlers
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .expect("event registry mutex poisoned")
            .handlers
            .len()
    }
}

/// Handle returned by `EventBus::subscribe`.
#[must_use = "keep the subscription to be able to cancel it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the handler. Safe to call after the bus is gone.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
