//! Sync status publisher
//!
//! Holds the current `SyncStatus` and fans every change out to registered
//! callbacks and to a `watch` channel. Callbacks receive the current snapshot
//! as soon as they register.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;

use crate::types::SyncStatus;

type Callback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

struct Inner {
    callbacks: Mutex<BTreeMap<u64, Callback>>,
    next_id: AtomicU64,
    sender: watch::Sender<SyncStatus>,
    /// Serializes delivery so callbacks observe snapshots in order
    delivery: ReentrantMutex<()>,
}

#[derive(Clone)]
pub struct StatusPublisher {
    inner: Arc<Inner>,
}

impl StatusPublisher {
    pub fn new(initial: SyncStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                callbacks: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                sender,
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn current(&self) -> SyncStatus {
        self.inner.sender.borrow().clone()
    }

    /// Apply a mutation and publish the result if anything changed
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SyncStatus),
    {
        let _delivery = self.inner.delivery.lock();

        let mut snapshot = None;
        let changed = self.inner.sender.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            if *status != before {
                snapshot = Some(status.clone());
                true
            } else {
                false
            }
        });

        if let Some(status) = snapshot {
            self.deliver(&status);
        }
        changed
    }

    fn deliver(&self, status: &SyncStatus) {
        let callbacks: Vec<Callback> = self.inner.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(status);
        }
    }

    /// Register a callback; it is invoked immediately with the current status
    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let _delivery = self.inner.delivery.lock();

        let callback: Callback = Arc::new(callback);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().insert(id, callback.clone());

        callback(&self.current());

        Subscription {
            id,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver that always holds the latest status
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.inner.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.callbacks.lock().len()
    }
}

/// Handle returned by `on_status_change`; dropping it unsubscribes
#[must_use = "dropping the subscription unsubscribes the callback"]
pub struct Subscription {
    id: u64,
    publisher: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            inner.callbacks.lock().remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
