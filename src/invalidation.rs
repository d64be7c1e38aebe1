//! Invalidation mode: an ambient flag that turns reads into invalidations.
//!
//! While the flag is active, [`ComputedFn::computed`](crate::ComputedFn::computed)
//! does not compute anything. It looks up the registered node for the call,
//! invalidates it and returns [`ComputeError::Invalidating`](crate::ComputeError::Invalidating).
//! Write paths use this to invalidate exactly the reads they made stale:
//!
//! ```ignore
//! counters.set(key.clone(), value);
//! Invalidation::scope(async {
//!     let _ = get_counter.computed(key).await;
//! })
//! .await;
//! ```

use std::future::Future;

tokio::task_local! {
    static INVALIDATING: bool;
}

/// Entry points for invalidation mode.
pub struct Invalidation;

impl Invalidation {
    /// Returns true if the current flow is in invalidation mode.
    pub fn is_active() -> bool {
        INVALIDATING.try_with(|active| *active).unwrap_or(false)
    }

    /// Run `fut` in invalidation mode.
    ///
    /// The flag follows the future across suspension points and worker
    /// threads, and is cleared when the future completes or is dropped.
    /// Tasks spawned from inside the scope do not inherit it.
    pub async fn scope<F: Future>(fut: F) -> F::Output {
        INVALIDATING.scope(true, fut).await
    }

    /// Run `fut` with invalidation mode switched off, even if the caller is
    /// inside an invalidation scope.
    pub async fn suspend<F: Future>(fut: F) -> F::Output {
        INVALIDATING.scope(false, fut).await
    }

    /// Prepare an invalidation scope. Nothing is switched on until the scope
    /// is [run](InvalidationScope::run) or
    /// [run synchronously](InvalidationScope::run_sync).
    pub fn begin() -> InvalidationScope {
        InvalidationScope { _private: () }
    }
}

/// Scope returned by [`Invalidation::begin`].
///
/// Invalidation mode is active exactly while the wrapped future or closure
/// runs, and only for it. It ends on completion, on drop and on panic.
#[must_use = "invalidation mode is only active inside `run` or `run_sync`"]
pub struct InvalidationScope {
    _private: (),
}

impl InvalidationScope {
    /// Run `fut` in invalidation mode.
    pub async fn run<F: Future>(self, fut: F) -> F::Output {
        INVALIDATING.scope(true, fut).await
    }

    /// Run `f` in invalidation mode on the current thread.
    pub fn run_sync<R>(self, f: impl FnOnce() -> R) -> R {
        INVALIDATING.sync_scope(true, f)
    }
}
