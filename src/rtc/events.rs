//! Typed event listeners
//!
//! One `Listeners<T>` per event kind. Handlers run on the emitting task, in
//! subscription order, outside the internal lock so a handler may subscribe
//! further handlers.

use parking_lot::Mutex;
use std::sync::Arc;

type Handler<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Listeners<T: 'static> {
    handlers: Mutex<Vec<Handler<T>>>,
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every future event
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribe_while(move |value| {
            handler(value);
            true
        });
    }

    /// Register a handler that stays subscribed for as long as it returns `true`
    pub fn subscribe_while(&self, handler: impl Fn(&T) -> bool + Send + Sync + 'static) {
        self.handlers.lock().push(Arc::new(handler));
    }

    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.handlers.lock().clone();
        let finished: Vec<Handler<T>> = handlers
            .into_iter()
            .filter(|handler| !handler(value))
            .collect();

        if !finished.is_empty() {
            self.handlers
                .lock()
                .retain(|h| !finished.iter().any(|f| Arc::ptr_eq(h, f)));
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_in_subscription_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u32 {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push((tag, *v)));
        }
        listeners.emit(&7);
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_subscribe_while_unsubscribes() {
        let listeners = Listeners::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        listeners.subscribe_while(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });
        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let listeners = Arc::new(Listeners::<()>::new());
        let inner = listeners.clone();
        listeners.subscribe_while(move |_| {
            inner.subscribe(|_| {});
            false
        });
        listeners.emit(&());
        assert_eq!(listeners.len(), 1);
    }
}
