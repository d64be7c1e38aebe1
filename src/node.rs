//! Computed nodes: cached value-or-error plus dependency links.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    CallIdentity, ComputeError, ComputedOptions, InvalidationQueue, Signal, Subscription, Version,
};

/// Consistency state of a computed node. Transitions only move forward:
/// `Computing -> Consistent`, or `Computing | Consistent -> Invalidated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConsistencyState {
    /// The value is being produced.
    Computing,
    /// The value is up to date.
    Consistent,
    /// The value is stale. Terminal.
    Invalidated,
}

impl ConsistencyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsistencyState::Computing,
            1 => ConsistencyState::Consistent,
            _ => ConsistencyState::Invalidated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConsistencyState::Computing => 0,
            ConsistencyState::Consistent => 1,
            ConsistencyState::Invalidated => 2,
        }
    }
}

/// Type-erased view of a computed node, as stored in the registry and in
/// dependency lists.
pub trait ComputedNode: Send + Sync + 'static {
    /// The call this node caches.
    fn identity(&self) -> &CallIdentity;

    /// Version tag assigned at creation.
    fn version(&self) -> Version;

    /// Current consistency state.
    fn state(&self) -> ConsistencyState;

    /// Invalidate the node. Returns true for the call that performed the
    /// transition; later calls are no-ops.
    fn invalidate(&self) -> bool;

    /// Signal set when the node becomes invalidated.
    fn invalidated_signal(&self) -> &Signal;

    /// Record a node read while computing this one.
    fn add_dependency(&self, dependency: Arc<dyn ComputedNode>);

    /// Record a node that read this one while computing.
    fn add_dependent(&self, dependent: Weak<dyn ComputedNode>);

    /// Number of recorded dependencies.
    fn dependency_count(&self) -> usize;

    /// Number of recorded dependents that are still alive.
    fn live_dependent_count(&self) -> usize;

    /// Drop dead dependent references. Returns how many were removed.
    fn compact_dependents(&self) -> usize;

    /// True while the node is invalidated locally but still waits for an
    /// acknowledgement that must stay reachable through the registry.
    fn is_synchronizing(&self) -> bool {
        false
    }

    /// Last time the node was read.
    fn last_access(&self) -> Instant;

    /// Mark the node as read now.
    fn touch(&self);

    /// Minimum time an unreferenced node stays cached after its last access.
    fn min_cache_duration(&self) -> Duration;

    /// Upcast for downcasting to the concrete node type.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Returns true if the node is consistent.
    fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// Returns true if the node is invalidated.
    fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }
}

/// Producer of fresh nodes for one call.
#[async_trait]
pub trait ComputedInput<T>: Send + Sync + 'static {
    /// The call this input produces nodes for.
    fn identity(&self) -> &CallIdentity;

    /// Get the current consistent node for the call, computing it if needed.
    async fn recompute(&self) -> Result<Arc<Computed<T>>, ComputeError>;
}

/// A cached result of one call.
///
/// The output is written once. Readers that depend on the node are recorded
/// as weak dependents and get invalidated together with it.
pub struct Computed<T> {
    input: Arc<dyn ComputedInput<T>>,
    version: Version,
    state: AtomicU8,
    output: OnceLock<Result<T, ComputeError>>,
    dependencies: Mutex<Vec<Arc<dyn ComputedNode>>>,
    dependents: Mutex<Vec<Weak<dyn ComputedNode>>>,
    invalidated: Signal,
    last_access: Mutex<Instant>,
    min_cache_duration: Duration,
    fanout: InvalidationQueue,
}

impl<T: 'static> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("identity", self.input.identity())
            .field("version", &self.version)
            .field("state", &ConsistencyState::from_u8(self.state.load(Ordering::SeqCst)))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Computed<T> {
    /// Create a node in the `Computing` state.
    pub fn new(
        input: Arc<dyn ComputedInput<T>>,
        version: Version,
        options: &ComputedOptions,
        fanout: InvalidationQueue,
    ) -> Self {
        Self {
            input,
            version,
            state: AtomicU8::new(ConsistencyState::Computing.as_u8()),
            output: OnceLock::new(),
            dependencies: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
            invalidated: Signal::new(),
            last_access: Mutex::new(Instant::now()),
            min_cache_duration: options.min_cache_duration,
            fanout,
        }
    }

    /// Store the output and move `Computing -> Consistent`.
    ///
    /// Returns false if an output was already stored or the node was
    /// invalidated while computing; in the latter case the output is still
    /// kept so that the computing caller can hand it out.
    pub fn try_set_output(&self, output: Result<T, ComputeError>) -> bool {
        if self.output.set(output).is_err() {
            return false;
        }
        self.state
            .compare_exchange(
                ConsistencyState::Computing.as_u8(),
                ConsistencyState::Consistent.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// The stored output, if computation finished.
    pub fn output(&self) -> Option<&Result<T, ComputeError>> {
        self.output.get()
    }

    /// The value, or the captured error.
    pub fn value(&self) -> Result<T, ComputeError> {
        match self.output.get() {
            Some(output) => output.clone(),
            None => Err(ComputeError::NotComputed),
        }
    }

    /// The value, or `T::default()` if the node holds an error or no output.
    pub fn value_or_default(&self) -> T
    where
        T: Default,
    {
        match self.output.get() {
            Some(Ok(value)) => value.clone(),
            _ => T::default(),
        }
    }

    /// The captured error, if any.
    pub fn error(&self) -> Option<ComputeError> {
        match self.output.get() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Wait until the node is invalidated.
    pub fn when_invalidated(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.invalidated.wait()
    }

    /// Run `callback` when the node is invalidated.
    ///
    /// If the node is already invalidated the callback runs immediately and
    /// `None` is returned.
    pub fn on_invalidated(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Option<Subscription> {
        let callback = Arc::new(Mutex::new(Some(callback)));
        let pending = callback.clone();
        let subscription = self.invalidated.subscribe(move || {
            if let Some(callback) = pending.lock().take() {
                callback();
            }
        });
        if subscription.is_none() {
            if let Some(callback) = callback.lock().take() {
                callback();
            }
        }
        subscription
    }

    /// The call this node caches.
    pub fn identity(&self) -> &CallIdentity {
        self.input.identity()
    }

    /// Version tag assigned at creation.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Current consistency state.
    pub fn state(&self) -> ConsistencyState {
        ConsistencyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns true if the node is consistent.
    pub fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    /// Returns true if the node is invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.state() == ConsistencyState::Invalidated
    }

    /// Invalidate the node and hand its dependents to the fan-out queue.
    /// Returns true for the call that performed the transition.
    pub fn invalidate(&self) -> bool {
        let invalidated = ConsistencyState::Invalidated.as_u8();
        if self.state.swap(invalidated, Ordering::SeqCst) == invalidated {
            return false;
        }
        trace!(node = ?self.identity(), version = self.version.0, "invalidated");
        self.invalidated.set();

        let dependents = std::mem::take(&mut *self.dependents.lock());
        self.dependencies.lock().clear();
        self.fanout.dispatch(dependents);
        true
    }

    /// The input this node was produced by.
    pub fn input(&self) -> &Arc<dyn ComputedInput<T>> {
        &self.input
    }

    /// Return this node if it is still consistent, otherwise the current
    /// consistent node for the same call (recomputing it if needed).
    pub async fn update(self: &Arc<Self>) -> Result<Arc<Computed<T>>, ComputeError> {
        if self.is_consistent() {
            return Ok(self.clone());
        }
        self.input.recompute().await
    }
}

impl<T: Clone + Send + Sync + 'static> ComputedNode for Computed<T> {
    fn identity(&self) -> &CallIdentity {
        Computed::identity(self)
    }

    fn version(&self) -> Version {
        Computed::version(self)
    }

    fn state(&self) -> ConsistencyState {
        Computed::state(self)
    }

    fn invalidate(&self) -> bool {
        Computed::invalidate(self)
    }

    fn is_consistent(&self) -> bool {
        Computed::is_consistent(self)
    }

    fn is_invalidated(&self) -> bool {
        Computed::is_invalidated(self)
    }

    fn invalidated_signal(&self) -> &Signal {
        &self.invalidated
    }

    fn add_dependency(&self, dependency: Arc<dyn ComputedNode>) {
        let mut dependencies = self.dependencies.lock();
        if self.state() != ConsistencyState::Invalidated {
            dependencies.push(dependency);
        }
    }

    fn add_dependent(&self, dependent: Weak<dyn ComputedNode>) {
        {
            let mut dependents = self.dependents.lock();
            if self.state() != ConsistencyState::Invalidated {
                dependents.push(dependent);
                return;
            }
        }
        // The reader observed a value that is already stale.
        if let Some(dependent) = dependent.upgrade() {
            dependent.invalidate();
        }
    }

    fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    fn live_dependent_count(&self) -> usize {
        self.dependents
            .lock()
            .iter()
            .filter(|d| d.strong_count() > 0)
            .count()
    }

    fn compact_dependents(&self) -> usize {
        let mut dependents = self.dependents.lock();
        let before = dependents.len();
        dependents.retain(|d| d.strong_count() > 0);
        before - dependents.len()
    }

    fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn min_cache_duration(&self) -> Duration {
        self.min_cache_duration
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
