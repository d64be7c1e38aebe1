//! One-shot signals with awaitable waiters and cancellable callbacks.
//!
//! A [`Signal`] is set at most once. Setting it runs every subscribed
//! callback synchronously on the setting thread, then wakes all waiters.
//! Computed nodes use one for "invalidated", remote calls use them for
//! "completed" and "invalidated", remote nodes for "synchronized".

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::ComputeError;

type Callback = Box<dyn FnOnce() + Send>;

struct SignalInner {
    set: AtomicBool,
    notify: Notify,
    // `None` once the signal fired; no further callbacks are accepted.
    callbacks: Mutex<Option<Slab<Callback>>>,
}

/// A one-shot latch. Cheap to clone; clones observe the same state.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("set", &self.is_set())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Signal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                set: AtomicBool::new(false),
                notify: Notify::new(),
                callbacks: Mutex::new(Some(Slab::new())),
            }),
        }
    }

    /// Returns true once the signal has been set.
    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Set the signal.
    ///
    /// Returns `false` if it was already set. Callbacks run in subscription
    /// order; a panicking callback is logged and does not prevent the others
    /// from running.
    pub fn set(&self) -> bool {
        let callbacks = {
            let mut guard = self.inner.callbacks.lock();
            let Some(callbacks) = guard.take() else {
                return false;
            };
            self.inner.set.store(true, Ordering::Release);
            callbacks
        };
        for (_, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("signal callback panicked");
            }
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Wait until the signal is set.
    pub fn wait(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let inner = self.inner.clone();
        async move {
            loop {
                let notified = inner.notify.notified();
                if inner.set.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        }
    }

    /// Wait until the signal is set or `cancel` fires.
    ///
    /// Cancelling the wait has no effect on the signal itself.
    pub async fn wait_or_cancel(&self, cancel: &CancellationToken) -> Result<(), ComputeError> {
        tokio::select! {
            biased;
            _ = self.wait() => Ok(()),
            _ = cancel.cancelled() => Err(ComputeError::Cancelled),
        }
    }

    /// Register `callback` to run when the signal is set.
    ///
    /// Returns `None` without running the callback if the signal is already
    /// set; callers decide what "already set" means for them. Dropping the
    /// returned [`Subscription`] unsubscribes; use [`Subscription::detach`]
    /// to keep the callback registered for the lifetime of the signal.
    #[must_use = "dropping the subscription unsubscribes the callback"]
    pub fn subscribe(&self, callback: impl FnOnce() + Send + 'static) -> Option<Subscription> {
        let mut guard = self.inner.callbacks.lock();
        let callbacks = guard.as_mut()?;
        let key = callbacks.insert(Box::new(callback));
        Some(Subscription {
            signal: Arc::downgrade(&self.inner),
            key: Some(key),
        })
    }

    /// Number of callbacks currently waiting for the signal.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .callbacks
            .lock()
            .as_ref()
            .map_or(0, |callbacks| callbacks.len())
    }
}

/// Handle to a callback registered with [`Signal::subscribe`].
pub struct Subscription {
    signal: Weak<SignalInner>,
    key: Option<usize>,
}

impl Subscription {
    /// Remove the callback. Returns true if it was still pending.
    pub fn cancel(mut self) -> bool {
        self.remove()
    }

    /// Keep the callback registered until the signal fires or is dropped.
    pub fn detach(mut self) {
        self.key = None;
    }

    fn remove(&mut self) -> bool {
        let Some(key) = self.key.take() else {
            return false;
        };
        let Some(signal) = self.signal.upgrade() else {
            return false;
        };
        let mut guard = signal.callbacks.lock();
        match guard.as_mut() {
            Some(callbacks) => callbacks.try_remove(key).is_some(),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
