//! Outbound calls: the client side of a computed value living on another host.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use computed_flow::{ComputeError, Signal};
use parking_lot::Mutex;
use tracing::trace;

/// An in-flight or completed call to the origin of a computed value.
///
/// The call completes once with the origin's result and is invalidated when
/// the origin's value changes. Disposing it releases the origin-side
/// subscription.
pub trait OutboundCall<T>: Send + Sync + 'static {
    /// Process-unique id of the call.
    fn id(&self) -> u64;

    /// Set when the result arrives.
    fn completed(&self) -> &Signal;

    /// Set when the origin reports the result as stale.
    fn invalidated(&self) -> &Signal;

    /// The result, once completed.
    fn result(&self) -> Option<Result<T, ComputeError>>;

    /// Release the call. Idempotent.
    fn dispose(&self);

    /// Returns true once the call was disposed.
    fn is_disposed(&self) -> bool;
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

type DisposeHook = Box<dyn FnOnce() + Send>;

/// A plain in-process [`OutboundCall`] driven by whoever holds it.
pub struct CallHandle<T> {
    id: u64,
    result: OnceLock<Result<T, ComputeError>>,
    completed: Signal,
    invalidated: Signal,
    disposed: AtomicBool,
    on_dispose: Mutex<Option<DisposeHook>>,
}

impl<T> fmt::Debug for CallHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("completed", &self.completed.is_set())
            .field("invalidated", &self.invalidated.is_set())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for CallHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> CallHandle<T> {
    /// Create a pending call.
    pub fn new() -> Self {
        Self {
            id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            result: OnceLock::new(),
            completed: Signal::new(),
            invalidated: Signal::new(),
            disposed: AtomicBool::new(false),
            on_dispose: Mutex::new(None),
        }
    }

    /// Store the result. Returns false if the call already completed.
    pub fn complete(&self, result: Result<T, ComputeError>) -> bool {
        if self.result.set(result).is_err() {
            return false;
        }
        trace!(call = self.id, "call completed");
        self.completed.set();
        true
    }

    /// Mark the result as stale. Returns false if already invalidated.
    pub fn invalidate(&self) -> bool {
        let changed = self.invalidated.set();
        if changed {
            trace!(call = self.id, "call invalidated");
        }
        changed
    }

    /// Run `hook` when the call is disposed, or right away if it already was.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut slot = self.on_dispose.lock();
            if !self.disposed.load(Ordering::SeqCst) {
                *slot = Some(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl<T: Clone + Send + Sync + 'static> OutboundCall<T> for CallHandle<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn completed(&self) -> &Signal {
        &self.completed
    }

    fn invalidated(&self) -> &Signal {
        &self.invalidated
    }

    fn result(&self) -> Option<Result<T, ComputeError>> {
        self.result.get().cloned()
    }

    fn dispose(&self) {
        let hook = {
            let mut slot = self.on_dispose.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
            slot.take()
        };
        trace!(call = self.id, "call disposed");
        if let Some(hook) = hook {
            hook();
        }
        self.complete(Err(ComputeError::Disposed));
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Shared handle to any outbound call.
pub type SharedCall<T> = Arc<dyn OutboundCall<T>>;
