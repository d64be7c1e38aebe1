//! Client-side replica of a computed value owned by another host.
//!
//! A [`RemoteComputed`] moves through `Unbound -> CallBound -> Synchronized`,
//! and can be invalidated at any point. An unbound node shows a cached
//! snapshot until a call is attached with [`RemoteComputed::bind_to_call`];
//! a node built from a completed call is bound and synchronized from the
//! start.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use computed_flow::{
    CallIdentity, ComputeError, Computed, ComputedInput, ComputedNode, ComputedOptions,
    ConsistencyState, InvalidationQueue, Signal, Subscription, Version,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{CachedSnapshot, SharedCall};

/// Producer of fresh remote nodes for one call.
#[async_trait]
pub trait RemoteInput<T>: Send + Sync + 'static {
    /// The call this input produces nodes for.
    fn identity(&self) -> &CallIdentity;

    /// The current consistent node for the call.
    async fn recompute(&self) -> Result<Arc<RemoteComputed<T>>, ComputeError>;
}

/// Everything a [`RemoteComputed`] needs besides its value.
pub struct RemoteSeed<T> {
    /// Where fresh nodes come from.
    pub input: Arc<dyn RemoteInput<T>>,
    /// Version tag of the node.
    pub version: Version,
    /// Caching options.
    pub options: ComputedOptions,
    /// Queue delivering invalidations to dependents.
    pub fanout: InvalidationQueue,
}

struct ValueInput<T>(Arc<dyn RemoteInput<T>>);

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ComputedInput<T> for ValueInput<T> {
    fn identity(&self) -> &CallIdentity {
        self.0.identity()
    }

    async fn recompute(&self) -> Result<Arc<Computed<T>>, ComputeError> {
        Ok(self.0.recompute().await?.computed().clone())
    }
}

/// A computed value replicated from its origin.
pub struct RemoteComputed<T: 'static> {
    computed: Arc<Computed<T>>,
    input: Arc<dyn RemoteInput<T>>,
    // Unset: unbound. `Some(None)`: bound to no call.
    call: OnceLock<Option<SharedCall<T>>>,
    cache_entry: Option<CachedSnapshot>,
    synchronized: Signal,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T: 'static> fmt::Debug for RemoteComputed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteComputed")
            .field("identity", self.input.identity())
            .field("bound", &self.call.get().is_some())
            .field("synchronized", &self.synchronized.is_set())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> RemoteComputed<T> {
    fn build(seed: RemoteSeed<T>, cache_entry: Option<CachedSnapshot>) -> Self {
        let computed = Computed::new(
            Arc::new(ValueInput(seed.input.clone())),
            seed.version,
            &seed.options,
            seed.fanout,
        );
        Self {
            computed: Arc::new(computed),
            input: seed.input,
            call: OnceLock::new(),
            cache_entry,
            synchronized: Signal::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// An unbound node showing a cached snapshot.
    pub fn from_cache(seed: RemoteSeed<T>, snapshot: CachedSnapshot) -> Result<Arc<Self>, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        let value = snapshot.decode::<T>()?;
        let node = Self::build(seed, Some(snapshot));
        node.computed.try_set_output(Ok(value));
        Ok(Arc::new(node))
    }

    /// A bound, synchronized node holding the result of a completed call.
    pub fn from_call(seed: RemoteSeed<T>, call: SharedCall<T>) -> Arc<Self> {
        let output = call.result().unwrap_or(Err(ComputeError::NotComputed));
        let node = Arc::new(Self::build(seed, None));
        node.computed.try_set_output(output);
        node.synchronized.set();
        if node.call.set(Some(call.clone())).is_ok() {
            node.forward_invalidation(&call);
        }
        node
    }

    /// A node holding `output` that no call backs, such as a failure to start
    /// the call. There is nothing to acknowledge, so it is synchronized.
    pub fn from_output(seed: RemoteSeed<T>, output: Result<T, ComputeError>) -> Arc<Self> {
        let node = Self::build(seed, None);
        node.computed.try_set_output(output);
        node.synchronized.set();
        Arc::new(node)
    }

    fn forward_invalidation(&self, call: &SharedCall<T>) {
        let computed = Arc::downgrade(&self.computed);
        let subscription = call.invalidated().subscribe(move || {
            if let Some(computed) = computed.upgrade() {
                computed.invalidate();
            }
        });
        match subscription {
            Some(subscription) => self.subscriptions.lock().push(subscription),
            None => {
                debug!(node = ?self.identity(), call = call.id(), "call invalidated before binding");
                self.computed.invalidate();
            }
        }
    }

    /// The local value view of this node.
    pub fn computed(&self) -> &Arc<Computed<T>> {
        &self.computed
    }

    /// The value, or the captured error.
    pub fn value(&self) -> Result<T, ComputeError> {
        self.computed.value()
    }

    /// The value, or `T::default()` on error.
    pub fn value_or_default(&self) -> T
    where
        T: Default,
    {
        self.computed.value_or_default()
    }

    /// The captured error, if any.
    pub fn error(&self) -> Option<ComputeError> {
        self.computed.error()
    }

    /// The bound call, if a call was bound.
    pub fn call(&self) -> Option<SharedCall<T>> {
        self.call.get().cloned().flatten()
    }

    /// Returns true once a binding (with or without a call) happened.
    pub fn is_bound(&self) -> bool {
        self.call.get().is_some()
    }

    /// Returns true once the origin acknowledged the value.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.is_set()
    }

    /// Wait until the origin acknowledged the value.
    pub fn when_synchronized(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.synchronized.wait()
    }

    /// Wait until the node is invalidated.
    pub fn when_invalidated(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.computed.when_invalidated()
    }

    /// Return this node if it is still consistent, otherwise the current
    /// consistent node for the same call.
    pub async fn update(self: &Arc<Self>) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        if self.computed.is_consistent() {
            return Ok(self.clone());
        }
        self.input.recompute().await
    }
}

impl<T> RemoteComputed<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Attach the call that refreshes this node.
    ///
    /// Only the first binding succeeds. A losing call is disposed without
    /// ever being subscribed to. Binding `None` invalidates the node.
    pub fn bind_to_call(self: &Arc<Self>, call: Option<SharedCall<T>>) -> bool {
        if let Err(call) = self.call.set(call) {
            if let Some(call) = call {
                trace!(node = ?self.identity(), call = call.id(), "lost bind race");
                call.dispose();
            }
            return false;
        }
        let Some(call) = self.call() else {
            debug!(node = ?self.identity(), "bound to no call");
            self.computed.invalidate();
            return true;
        };
        trace!(node = ?self.identity(), call = call.id(), "bound to call");
        self.forward_invalidation(&call);

        if self.cache_entry.is_none() {
            self.synchronized.set();
            return true;
        }
        let this = Arc::downgrade(self);
        match call.completed().subscribe(move || {
            if let Some(this) = this.upgrade() {
                this.on_call_completed();
            }
        }) {
            Some(subscription) => self.subscriptions.lock().push(subscription),
            None => self.on_call_completed(),
        }
        true
    }

    fn on_call_completed(&self) {
        let result = self.call().and_then(|call| call.result());
        let matches = match (&result, &self.cache_entry) {
            (Some(Ok(value)), Some(cached)) => {
                CachedSnapshot::encode(value).is_ok_and(|fresh| &fresh == cached)
            }
            _ => false,
        };
        self.synchronized.set();
        if matches {
            trace!(node = ?self.identity(), "cached value confirmed");
        } else {
            debug!(node = ?self.identity(), "cached value is stale");
            self.computed.invalidate();
        }
    }
}

impl<T: 'static> Drop for RemoteComputed<T> {
    fn drop(&mut self) {
        if let Some(Some(call)) = self.call.get() {
            if !call.completed().is_set() {
                call.dispose();
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ComputedNode for RemoteComputed<T> {
    fn identity(&self) -> &CallIdentity {
        self.input.identity()
    }

    fn version(&self) -> Version {
        self.computed.version()
    }

    fn state(&self) -> ConsistencyState {
        self.computed.state()
    }

    fn invalidate(&self) -> bool {
        self.computed.invalidate()
    }

    fn invalidated_signal(&self) -> &Signal {
        self.computed.invalidated_signal()
    }

    fn add_dependency(&self, dependency: Arc<dyn ComputedNode>) {
        self.computed.add_dependency(dependency)
    }

    fn add_dependent(&self, dependent: Weak<dyn ComputedNode>) {
        self.computed.add_dependent(dependent)
    }

    fn dependency_count(&self) -> usize {
        self.computed.dependency_count()
    }

    fn live_dependent_count(&self) -> usize {
        self.computed.live_dependent_count()
    }

    fn compact_dependents(&self) -> usize {
        self.computed.compact_dependents()
    }

    fn is_synchronizing(&self) -> bool {
        self.cache_entry.is_some()
            && !self.synchronized.is_set()
            && !matches!(self.call.get(), Some(None))
    }

    fn last_access(&self) -> Instant {
        self.computed.last_access()
    }

    fn touch(&self) {
        self.computed.touch()
    }

    fn min_cache_duration(&self) -> Duration {
        self.computed.min_cache_duration()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{CallHandle, OutboundCall};
    use computed_flow::FunctionId;

    pub(crate) struct DetachedInput(pub CallIdentity);

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> RemoteInput<T> for DetachedInput {
        fn identity(&self) -> &CallIdentity {
            &self.0
        }

        async fn recompute(&self) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
            Err(ComputeError::Disposed)
        }
    }

    pub(crate) fn seed<T: Clone + Send + Sync + 'static>(queue: &InvalidationQueue) -> RemoteSeed<T> {
        RemoteSeed {
            input: Arc::new(DetachedInput(CallIdentity::new(FunctionId::new("remote"), 1u32))),
            version: Version(1),
            options: ComputedOptions::default(),
            fanout: queue.clone(),
        }
    }

    fn shared(call: &Arc<CallHandle<i32>>) -> SharedCall<i32> {
        call.clone()
    }

    fn cached(queue: &InvalidationQueue, value: i32) -> Arc<RemoteComputed<i32>> {
        RemoteComputed::from_cache(seed(queue), CachedSnapshot::encode(&value).unwrap()).unwrap()
    }

    #[test]
    fn test_cached_node_is_unbound_and_synchronizing() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        assert_eq!(node.value().unwrap(), 3);
        assert!(node.is_consistent());
        assert!(!node.is_bound());
        assert!(!node.is_synchronized());
        assert!(node.is_synchronizing());
    }

    #[test]
    fn test_undecodable_snapshot_is_rejected() {
        let queue = InvalidationQueue::new(8);
        let snapshot = CachedSnapshot::encode(&"text").unwrap();
        assert!(RemoteComputed::<i32>::from_cache(seed(&queue), snapshot).is_err());
    }

    #[test]
    fn test_matching_call_result_synchronizes() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        let call = Arc::new(CallHandle::<i32>::new());
        assert!(node.bind_to_call(Some(shared(&call))));
        assert!(!node.is_synchronized());

        call.complete(Ok(3));
        assert!(node.is_synchronized());
        assert!(node.is_consistent());
        assert!(!node.is_synchronizing());
    }

    #[test]
    fn test_different_call_result_invalidates() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        let call = Arc::new(CallHandle::<i32>::new());
        call.complete(Ok(4));
        assert!(node.bind_to_call(Some(shared(&call))));
        assert!(node.is_synchronized());
        assert!(node.is_invalidated());
    }

    #[test]
    fn test_binding_none_invalidates() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        assert!(node.bind_to_call(None));
        assert!(node.is_invalidated());
        assert!(!node.is_synchronizing());
        assert!(node.call().is_none());
    }

    #[test]
    fn test_second_binding_loses_and_disposes_its_call() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        let first = Arc::new(CallHandle::<i32>::new());
        let second = Arc::new(CallHandle::<i32>::new());
        assert!(node.bind_to_call(Some(shared(&first))));
        assert!(!node.bind_to_call(Some(shared(&second))));

        assert!(second.is_disposed());
        assert_eq!(second.invalidated().subscriber_count(), 0);
        assert_eq!(second.completed().subscriber_count(), 0);
        assert_eq!(first.invalidated().subscriber_count(), 1);

        // The loser's invalidation never reaches the node.
        second.invalidate();
        assert!(node.is_consistent());
    }

    #[test]
    fn test_concurrent_bindings_have_one_winner() {
        let queue = InvalidationQueue::new(64);
        let node = cached(&queue, 3);
        let calls: Vec<Arc<CallHandle<i32>>> = (0..8).map(|_| Arc::new(CallHandle::new())).collect();
        let barrier = Arc::new(std::sync::Barrier::new(calls.len()));

        let won: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = calls
                .iter()
                .map(|call| {
                    let node = node.clone();
                    let barrier = barrier.clone();
                    let call = shared(call);
                    scope.spawn(move || {
                        barrier.wait();
                        node.bind_to_call(Some(call))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(won.iter().filter(|w| **w).count(), 1);

        for (call, won) in calls.iter().zip(&won) {
            if *won {
                assert!(!call.is_disposed());
                assert_eq!(call.invalidated().subscriber_count(), 1);
            } else {
                assert!(call.is_disposed());
                assert_eq!(call.invalidated().subscriber_count(), 0);
                assert_eq!(call.completed().subscriber_count(), 0);
                call.invalidate();
            }
        }
        assert!(node.is_consistent());
    }

    #[test]
    fn test_call_invalidation_is_forwarded() {
        let queue = InvalidationQueue::new(8);
        let call = Arc::new(CallHandle::<i32>::new());
        call.complete(Ok(1));
        let node = RemoteComputed::from_call(seed(&queue), shared(&call));
        assert!(node.is_synchronized());
        assert_eq!(node.value().unwrap(), 1);

        call.invalidate();
        assert!(node.is_invalidated());
    }

    #[test]
    fn test_already_invalidated_call_invalidates_on_bind() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        let call = Arc::new(CallHandle::<i32>::new());
        call.invalidate();
        assert!(node.bind_to_call(Some(shared(&call))));
        assert!(node.is_invalidated());
        assert_eq!(call.invalidated().subscriber_count(), 0);
    }

    #[test]
    fn test_drop_disposes_incomplete_call() {
        let queue = InvalidationQueue::new(8);
        let node = cached(&queue, 3);
        let call = Arc::new(CallHandle::<i32>::new());
        node.bind_to_call(Some(shared(&call)));
        drop(node);
        assert!(call.is_disposed());
        assert_eq!(call.invalidated().subscriber_count(), 0);
    }

    #[test]
    fn test_drop_keeps_completed_call() {
        let queue = InvalidationQueue::new(8);
        let call = Arc::new(CallHandle::<i32>::new());
        call.complete(Ok(1));
        let node = RemoteComputed::from_call(seed(&queue), shared(&call));
        drop(node);
        assert!(!call.is_disposed());
    }

    #[test]
    fn test_output_node_holds_error() {
        let queue = InvalidationQueue::new(8);
        let node = RemoteComputed::<i32>::from_output(seed(&queue), Err(ComputeError::Cancelled));
        assert!(node.is_consistent());
        assert!(node.is_synchronized());
        assert!(matches!(node.error(), Some(ComputeError::Cancelled)));
        assert_eq!(node.value_or_default(), 0);
    }
}
