//! Event Subscribers
//!
//! Explicit subscriber lists, notified synchronously on the state
//! transition that produced the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by `subscribe`, unique across all lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A list of handlers for one kind of event
pub struct Subscribers<E> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Subscribers<E> {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns false if it was not in this list
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Call every handler with the event
    pub fn notify(&self, event: &E) {
        // Handlers may subscribe or unsubscribe, so call them unlocked
        let handlers: Vec<Handler<E>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_and_unsubscribe() {
        let subscribers: Subscribers<u32> = Subscribers::new();
        let total = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&total);
        let id = subscribers.subscribe(move |n| {
            seen.fetch_add(*n as usize, Ordering::SeqCst);
        });
        let seen = Arc::clone(&total);
        subscribers.subscribe(move |_| {
            seen.fetch_add(100, Ordering::SeqCst);
        });

        subscribers.notify(&1);
        assert_eq!(total.load(Ordering::SeqCst), 101);

        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        subscribers.notify(&1);
        assert_eq!(total.load(Ordering::SeqCst), 201);
        assert_eq!(subscribers.len(), 1);
    }

    #[test]
    fn test_ids_unique_across_lists() {
        let a: Subscribers<()> = Subscribers::new();
        let b: Subscribers<String> = Subscribers::new();
        let id_a = a.subscribe(|_| {});
        let id_b = b.subscribe(|_| {});
        assert_ne!(id_a, id_b);
        assert!(!b.unsubscribe(id_a));
    }
}
