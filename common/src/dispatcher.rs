//! Minimal typed publish/subscribe primitive.
//!
//! One dispatcher per event payload type keeps payloads compile-time safe.
//! Every subscriber owns a buffered channel sized by its own `capacity`
//! argument; a subscriber that stops draining loses deliveries once its
//! buffer fills, but can never block or deadlock the firing thread.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

struct DispatcherInner<T> {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::Sender<T>)>,
}

/// Fan-out event source. Cheap to clone; clones share the subscriber list.
pub struct Dispatcher<T> {
    inner: Arc<Mutex<DispatcherInner<T>>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatcherInner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Register a new subscriber with a receive buffer of `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, tx));
        Subscription {
            id,
            rx,
            inner: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("dispatcher lock poisoned").subscribers.len()
    }
}

impl<T: Clone> Dispatcher<T> {
    /// Deliver `value` to every currently registered subscriber.
    ///
    /// The subscriber list is snapshotted before delivery, so subscribers
    /// added or removed while this call iterates do not disturb it. Delivery
    /// uses `try_send`: a full or abandoned buffer drops that one delivery.
    pub fn fire(&self, value: &T) {
        let targets: Vec<mpsc::Sender<T>> = {
            let inner = self.inner.lock().expect("dispatcher lock poisoned");
            inner.subscribers.iter().map(|(_, tx)| tx.clone()).collect()
        };
        for tx in targets {
            let _ = tx.try_send(value.clone());
        }
    }
}

/// Handle to one subscriber's event channel.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    inner: Arc<Mutex<DispatcherInner<T>>>,
}

impl<T> Subscription<T> {
    /// Receive the next event. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Direct access to the receive channel, for `select!` loops.
    pub fn channel(&mut self) -> &mut mpsc::Receiver<T> {
        &mut self.rx
    }

    /// Remove this subscriber from the dispatcher. Idempotent, and safe to
    /// call from the handler currently draining the channel.
    pub fn unsubscribe(&self) {
        let mut inner = self.inner.lock().expect("dispatcher lock poisoned");
        inner.subscribers.retain(|(id, _)| *id != self.id);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe(4);
        let mut b = dispatcher.subscribe(4);

        dispatcher.fire(&7u64);

        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_fire() {
        let dispatcher = Dispatcher::new();
        let mut slow = dispatcher.subscribe(1);

        // Second fire overflows the capacity-1 buffer and is dropped
        dispatcher.fire(&1u64);
        dispatcher.fire(&2u64);

        assert_eq!(slow.try_recv(), Some(1));
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let dispatcher = Dispatcher::<u64>::new();
        let sub = dispatcher.subscribe(1);
        assert_eq!(dispatcher.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let dispatcher = Dispatcher::<u64>::new();
        {
            let _sub = dispatcher.subscribe(1);
            assert_eq!(dispatcher.subscriber_count(), 1);
        }
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn fire_with_no_subscribers_is_a_no_op() {
        let dispatcher = Dispatcher::<u64>::new();
        dispatcher.fire(&1);
    }
}
