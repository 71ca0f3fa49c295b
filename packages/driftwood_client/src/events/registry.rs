//! Ordered observer registry for status and event notifications.
//!
//! Notification is a plain synchronous iteration in subscription order, so
//! subscribers observe transitions in the order they happened. A broadcast
//! channel would decouple delivery from the transition; the registry keeps
//! them in the same call stack.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle returned from [`ObserverRegistry::subscribe`]; pass it back to
/// [`ObserverRegistry::unsubscribe`] to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Observers<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A list of subscriber callbacks, notified synchronously in subscription
/// order.
pub struct ObserverRegistry<T> {
    observers: Mutex<Observers<T>>,
}

impl<T> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Observers {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Observers<T>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback. Callbacks run on the thread that triggers the
    /// notification, so they should be quick and must not block.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriberId {
        let mut observers = self.lock();
        observers.next_id += 1;
        let id = observers.next_id;
        observers.entries.push((id, Arc::new(callback)));
        SubscriberId(id)
    }

    /// Remove a callback. Unknown ids are ignored, so unsubscribing twice is
    /// harmless.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock().entries.retain(|(entry_id, _)| *entry_id != id.0);
    }

    /// Invoke every callback with `value`, in subscription order.
    ///
    /// The entry list is snapshotted first so a callback may subscribe or
    /// unsubscribe without deadlocking; such changes take effect from the
    /// next notification.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

impl<T> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn notifies_in_subscription_order() {
        let registry = ObserverRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.subscribe(move |value: &u32| {
                seen.lock().unwrap().push((tag, *value));
            });
        }

        registry.notify(&7);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("first", 7), ("second", 7), ("third", 7)]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = ObserverRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counted = count.clone();
        let id = registry.subscribe(move |_: &u32| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify(&1);
        registry.unsubscribe(id);
        registry.notify(&2);
        // Unknown id: no-op
        registry.unsubscribe(id);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn subscriber_may_unsubscribe_itself_during_notify() {
        let registry = Arc::new(ObserverRegistry::new());
        let count = Arc::new(AtomicUsize::new(0));

        let reg = registry.clone();
        let counted = count.clone();
        let id = Arc::new(Mutex::new(None));
        let id_slot = id.clone();
        let assigned = registry.subscribe(move |_: &u32| {
            counted.fetch_add(1, Ordering::SeqCst);
            if let Some(own_id) = *id_slot.lock().unwrap() {
                reg.unsubscribe(own_id);
            }
        });
        *id.lock().unwrap() = Some(assigned);

        registry.notify(&1);
        registry.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
