//! Typed observer lists.
//!
//! Each subscriber gets its own unbounded channel. Emission holds one lock
//! for the whole fan-out, so every subscriber observes events in exactly the
//! order they were emitted, once each.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// A list of subscribers for one event kind.
pub struct EventEmitter<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E: Clone> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber. Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, pruning dropped ones.
    pub fn emit(&self, event: E) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Run `f` while holding the emission lock, then emit what it returns.
    ///
    /// Used when a state mutation and its event must be atomic with respect to
    /// other emitters of the same list.
    pub fn emit_with<F>(&self, f: F)
    where
        F: FnOnce() -> Option<E>,
    {
        let mut subscribers = self.lock();
        if let Some(event) = f() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        // A panic while emitting leaves the list itself intact.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E: Clone> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();

        for i in 0..5 {
            emitter.emit(i);
        }

        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(i));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_each_event_once() {
        let emitter = EventEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();

        emitter.emit("hello");

        assert_eq!(a.recv().await, Some("hello"));
        assert_eq!(b.recv().await, Some("hello"));
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let emitter = EventEmitter::<u8>::new();
        let rx = emitter.subscribe();
        let _keep = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        drop(rx);
        emitter.emit(1);
        assert_eq!(emitter.subscriber_count(), 1);
    }

    #[test]
    fn test_emit_with_skips_none() {
        let emitter = EventEmitter::<u8>::new();
        let mut rx = emitter.subscribe();

        emitter.emit_with(|| None);
        emitter.emit_with(|| Some(3));

        assert_eq!(rx.try_recv().ok(), Some(3));
        assert!(rx.try_recv().is_err());
    }
}
