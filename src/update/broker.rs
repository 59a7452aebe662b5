//! Fan-out of events from one producer to any number of live subscribers.
//!
//! Publishing never waits: a subscriber whose buffer is full misses the event.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};

pub const SUBSCRIBER_CAPACITY: usize = 100;

struct Inner<E> {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<E>>>,
}

impl<E> Inner<E> {
    fn remove(&self, id: u64) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.remove(&id);
    }
}

pub struct EventBroker<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventBroker<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventBroker<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl<E: Clone> EventBroker<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, tx);
        log::debug!("New upgrade event subscriber {id}");
        Subscription {
            id,
            rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Remove the subscription and close its channel.
    pub fn unsubscribe(&self, subscription: Subscription<E>) {
        drop(subscription);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn publish(&self, event: E) {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Subscriber {id} is not keeping up, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Subscriber {id} is gone");
                }
            }
        }
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::Receiver<E>,
    broker: Weak<Inner<E>>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    #[cfg(test)]
    fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove(self.id);
        }
        self.rx.close();
    }
}
