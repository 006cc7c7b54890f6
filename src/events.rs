//! Typed event objects with explicit subscribe/unsubscribe.
//!
//! Delivery is synchronous on the raising thread. Subscribers are kept as
//! handles so a listener can be detached without touching the source.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`Event::subscribe`].
pub type SubscriptionId = u32;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A fan-out notification channel.
pub struct Event<T> {
    subscribers: Mutex<Vec<(SubscriptionId, Callback<T>)>>,
    next_id: AtomicU32,
}

impl<T> Event<T> {
    /// Creates an event with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Registers a subscriber and returns its handle.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((id, Arc::new(f)));
        id
    }

    /// Removes a subscriber. Returns false if the handle is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Delivers `arg` to every subscriber, in subscription order.
    ///
    /// The subscriber list is snapshotted first, so a handler may
    /// subscribe or unsubscribe on this same event without deadlocking.
    pub fn raise(&self, arg: &T) {
        let snapshot: Vec<Callback<T>> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in snapshot {
            f(arg);
        }
    }

    /// True when nobody listens.
    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().unwrap().is_empty()
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Decider<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// A single-handler channel whose delivery returns a decision.
pub struct Request<T> {
    handler: Mutex<Option<Decider<T>>>,
}

impl<T> Request<T> {
    /// Creates a request with no handler installed.
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }

    /// Installs the handler, replacing any previous one.
    pub fn set<F>(&self, f: F)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Some(Arc::new(f));
    }

    /// Removes the handler.
    pub fn clear(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Asks the handler; returns `default` when none is installed.
    pub fn raise(&self, arg: &T, default: bool) -> bool {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(f) => f(arg),
            None => default,
        }
    }
}

impl<T> Default for Request<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_raise_unsubscribe() {
        let event: Event<u32> = Event::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = event.subscribe(move |v| {
            c.fetch_add(*v as usize, Ordering::SeqCst);
        });

        event.raise(&2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(event.unsubscribe(id));
        event.raise(&5);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(!event.unsubscribe(id));
    }

    #[test]
    fn test_unsubscribe_from_handler() {
        let event: Arc<Event<()>> = Arc::new(Event::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let ev = event.clone();
        let f = fired.clone();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let id = event.subscribe(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot2.lock().unwrap().take() {
                ev.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        event.raise(&());
        event.raise(&());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_default_and_handler() {
        let req: Request<u32> = Request::new();
        assert!(req.raise(&1, true));
        assert!(!req.raise(&1, false));

        req.set(|v| *v > 10);
        assert!(req.raise(&11, false));
        assert!(!req.raise(&9, true));

        req.clear();
        assert!(req.raise(&11, true));
    }
}
