// Event bus - Typed publish/subscribe with unsubscribe handles
//
// Listeners run on the publishing thread. A panicking listener is logged and
// skipped; the others still receive the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

type Listener<E> = Arc<Mutex<Box<dyn FnMut(&E) + Send>>>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&E) + Send + 'static,
    {
        let boxed: Box<dyn FnMut(&E) + Send> = Box::new(listener);
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(Mutex::new(boxed))));
            id
        };

        let registry: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    lock(&registry).listeners.retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Deliver to every current listener, returning how many handled it
    pub fn publish(&self, event: &E) -> usize {
        let listeners: Vec<(u64, Listener<E>)> = lock(&self.registry).listeners.clone();

        let mut delivered = 0;
        for (id, listener) in listeners {
            let mut guard = match listener.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    // Listener is publishing from inside its own callback
                    tracing::debug!(listener = id, "Skipping re-entrant listener");
                    continue;
                }
            };
            match catch_unwind(AssertUnwindSafe(|| (&mut **guard)(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(listener = id, %reason, "Event listener panicked");
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    pub fn clear(&self) {
        lock(&self.registry).listeners.clear();
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the bus's whole lifetime
    pub fn detach(mut self) {
        self.cancel = None;
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_all_listeners() {
        let bus = EventBus::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = bus.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = bus.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&2), 2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_unsubscribe_and_drop() {
        let bus = EventBus::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&0);
        sub.unsubscribe();
        bus.publish(&0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        {
            let _scoped = bus.subscribe(|_| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_detached_listener_stays() {
        let bus = EventBus::<u32>::new();
        bus.subscribe(|_| {}).detach();
        assert_eq!(bus.subscriber_count(), 1);
        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(|_| panic!("listener failure"));
        let h = hits.clone();
        let _good = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&1), 1);
        assert_eq!(bus.publish(&2), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = EventBus::<u32>::new();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        assert!(sub.is_active());
        sub.unsubscribe();
    }
}
