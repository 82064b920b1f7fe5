//! Typed publish/subscribe bus owned by the session.
//!
//! Listeners are plain callbacks invoked synchronously on the publishing
//! task, after the listener table lock is released, so a callback may read
//! any component (or even publish) without deadlocking. Every subscription
//! returns a `Subscription` handle; dropping it unsubscribes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use veil_core::{
    ConnectionState, ContentHash, PeerId, PersistenceError, TransferDirection, TransferState,
};

use crate::bootstrap::BootstrapPhase;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct BusInner<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback. It stays registered until the returned handle
    /// is dropped or `unsubscribe`d.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(callback)));

        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners.lock().retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Deliver an event to every current listener.
    pub fn publish(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Bridge the bus into an async channel, for consumers that prefer
    /// `recv().await` over callbacks.
    pub fn subscribe_channel(&self) -> (mpsc::UnboundedReceiver<E>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe(move |e: &E| {
            let _ = tx.send(e.clone());
        });
        (rx, sub)
    }
}

/// Handle for one registered listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

// ── Session events ────────────────────────────────────────────────────────────

/// Everything the session core announces on its bus.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Bootstrap(BootstrapPhase),
    PeerChanged {
        peer: PeerId,
        from: Option<ConnectionState>,
        to: ConnectionState,
    },
    PeerRemoved(PeerId),
    Transfer {
        id: u64,
        hash: ContentHash,
        direction: TransferDirection,
        state: TransferState,
        path: PathBuf,
    },
    SettingChanged {
        key: String,
        value: String,
    },
    PersistenceFailed(PersistenceError),
}
