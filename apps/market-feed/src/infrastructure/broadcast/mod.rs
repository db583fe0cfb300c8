//! Listener Registry
//!
//! Callback-based fan-out for price snapshots and status events.
//!
//! # Architecture
//!
//! A `ListenerRegistry<T>` holds an ordered list of callbacks. A broadcast
//! copies the list under a short lock, releases it, then invokes each
//! callback in registration order. Callbacks may therefore register or
//! cancel listeners (including themselves) while being invoked.
//!
//! Each callback runs under `catch_unwind`; a panicking listener is logged
//! and counted and the remaining listeners still receive the event.
//!
//! Registration returns a [`Subscription`]. Cancelling it is idempotent,
//! works after the registry has been dropped, and happens automatically when
//! the subscription is dropped.
//!
//! For consumers that prefer a queue, [`ListenerRegistry::channel`] wraps a
//! bounded `tokio::sync::mpsc` channel. A full queue drops that delivery for
//! that consumer only.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::infrastructure::metrics;

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

// =============================================================================
// Registry
// =============================================================================

struct RegistryInner<T> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> RegistryInner<T> {
    fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Removal hook used by [`Subscription`] without knowing the event type.
trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<T> Detach for RegistryInner<T> {
    fn detach(&self, id: u64) -> bool {
        let remaining = {
            let mut listeners = self.listeners.lock();
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.len() == before {
                return false;
            }
            listeners.len()
        };

        metrics::set_listeners(self.name, remaining);
        tracing::debug!(registry = self.name, listener_id = id, remaining, "Listener removed");
        true
    }

    fn contains(&self, id: u64) -> bool {
        self.listeners.lock().iter().any(|(listener_id, _)| *listener_id == id)
    }
}

/// Ordered set of callbacks receiving values of type `T`.
pub struct ListenerRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for ListenerRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.inner.name)
            .field("listeners", &self.inner.len())
            .finish_non_exhaustive()
    }
}

impl<T: 'static> ListenerRegistry<T> {
    /// Create an empty registry. `name` labels logs and metrics.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                name,
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback. It receives every later broadcast until the
    /// returned subscription is cancelled or dropped.
    pub fn register<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register_replaying(listener, None)
    }

    /// Register a callback, first handing it `replay` (if any).
    ///
    /// The replay is delivered before the listener joins the list, so a
    /// concurrent broadcast cannot reach it out of order as long as the
    /// caller serializes this call with its broadcasts.
    pub fn register_replaying<F>(&self, listener: F, replay: Option<&T>) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(value) = replay {
            self.invoke(id, &listener, value);
        }

        let count = {
            let mut listeners = self.inner.listeners.lock();
            listeners.push((id, listener));
            listeners.len()
        };

        metrics::set_listeners(self.inner.name, count);
        tracing::debug!(registry = self.inner.name, listener_id = id, count, "Listener added");

        let weak: Weak<dyn Detach> = Arc::downgrade(&self.inner) as Weak<dyn Detach>;
        Subscription {
            id,
            registry: weak,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Deliver `value` to every listener in registration order.
    ///
    /// Returns the number of listeners that returned normally.
    pub fn broadcast(&self, value: &T) -> usize {
        self.broadcast_while(value, || true)
    }

    /// Like [`broadcast`](Self::broadcast), but consults `proceed` before
    /// each delivery and stops at the first `false`.
    pub fn broadcast_while<P>(&self, value: &T, mut proceed: P) -> usize
    where
        P: FnMut() -> bool,
    {
        let listeners: Vec<(u64, Listener<T>)> = self.inner.listeners.lock().clone();

        let mut delivered = 0;
        for (id, listener) in &listeners {
            if !proceed() {
                break;
            }
            if self.invoke(*id, listener, value) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registry name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    fn invoke(&self, id: u64, listener: &Listener<T>, value: &T) -> bool {
        match catch_unwind(AssertUnwindSafe(|| listener(value))) {
            Ok(()) => true,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());

                metrics::record_listener_panic(self.inner.name);
                tracing::warn!(
                    registry = self.inner.name,
                    listener_id = id,
                    panic = %message,
                    "Listener panicked; continuing with remaining listeners"
                );
                false
            }
        }
    }
}

impl<T: Clone + Send + 'static> ListenerRegistry<T> {
    /// Register a bounded channel instead of a callback.
    ///
    /// Deliveries use `try_send`; when the queue is full the value is
    /// dropped for this consumer and counted.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, as `tokio::sync::mpsc::channel` does.
    #[must_use]
    pub fn channel(&self, capacity: usize, replay: Option<&T>) -> ChannelSubscription<T> {
        let (tx, receiver) = mpsc::channel(capacity);
        let name = self.inner.name;

        let subscription = self.register_replaying(
            move |value: &T| match tx.try_send(value.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::record_channel_drop();
                    tracing::debug!(registry = name, "Consumer channel full, dropping delivery");
                }
            },
            replay,
        );

        ChannelSubscription {
            receiver,
            subscription,
        }
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Handle to a registered listener.
///
/// Dropping the handle cancels the listener.
#[must_use = "dropping a Subscription immediately unregisters the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Detach>,
    cancelled: AtomicBool,
}

impl Subscription {
    /// Unregister the listener. Calling this more than once, or after the
    /// registry is gone, does nothing.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let _ = registry.detach(self.id);
        }
    }

    /// Whether the listener is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
            && self
                .registry
                .upgrade()
                .is_some_and(|registry| registry.contains(self.id))
    }

    /// Listener identifier, unique within its registry.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A bounded receiver paired with its registration.
#[must_use = "dropping a ChannelSubscription immediately unregisters it"]
#[derive(Debug)]
pub struct ChannelSubscription<T> {
    receiver: mpsc::Receiver<T>,
    subscription: Subscription,
}

impl<T> ChannelSubscription<T> {
    /// Receive the next value. Returns `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<T> {
        if !self.subscription.is_active() {
            return self.receiver.try_recv().ok();
        }
        self.receiver.recv().await
    }

    /// Receive without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue is empty or disconnected.
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Stop further deliveries. Values already queued stay readable.
    pub fn cancel(&self) {
        self.subscription.cancel();
    }

    /// Split into the raw receiver and the registration handle.
    pub fn into_parts(self) -> (mpsc::Receiver<T>, Subscription) {
        (self.receiver, self.subscription)
    }
}

// =============================================================================
// Tests
// =============================================================================
