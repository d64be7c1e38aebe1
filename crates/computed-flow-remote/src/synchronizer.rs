//! Memoized access to computed values owned by another host.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use computed_flow::{
    CallIdentity, ComputeError, ComputedFn, ComputedNode, ComputedOptions, ComputedRuntime,
    ComputedSource, FunctionId, Invalidation, LockFlowSnapshot,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    CachedSnapshot, CallHandle, CallStartError, ExponentialDelays, RemoteComputed,
    RemoteInput, RemoteSeed, RetryDelay, RetryDelays, SharedCall, SnapshotCache,
};

/// Transport that starts calls on the origin host.
#[async_trait]
pub trait RemoteClient<K, T>: Send + Sync + 'static {
    /// Start a call for `key`.
    ///
    /// Return [`CallStartError::Reroute`] to have the call retried after the
    /// next reroute delay.
    async fn start_call(&self, key: K) -> Result<SharedCall<T>, CallStartError>;
}

/// Options of a [`RemoteComputedFn`].
#[derive(Clone)]
pub struct RemoteFnOptions {
    /// Delays between reroute retries. Unbounded unless the sequence says so.
    pub reroute_delays: Arc<dyn RetryDelays>,
    /// Caching options of the produced nodes. `error_invalidation_delay`
    /// applies to calls that failed to start.
    pub computed: ComputedOptions,
}

impl Default for RemoteFnOptions {
    fn default() -> Self {
        Self {
            reroute_delays: Arc::new(ExponentialDelays::default()),
            computed: ComputedOptions::default(),
        }
    }
}

impl RemoteFnOptions {
    /// Use `delays` between reroute retries.
    pub fn reroute_delays(mut self, delays: impl RetryDelays) -> Self {
        self.reroute_delays = Arc::new(delays);
        self
    }

    /// Use `options` for the produced nodes.
    pub fn computed(mut self, options: ComputedOptions) -> Self {
        self.computed = options;
        self
    }
}

struct RemoteFnInner<K, T> {
    id: FunctionId,
    runtime: ComputedRuntime,
    client: Arc<dyn RemoteClient<K, T>>,
    cache: Option<Arc<dyn SnapshotCache>>,
    options: RemoteFnOptions,
}

/// A memoized function whose values are computed by a remote origin.
///
/// Reads go through the same registry and per-call lock as local
/// [`ComputedFn`]s, and remote nodes can be dependencies of local ones.
/// With a [`SnapshotCache`], a cached value is served right away while the
/// call runs in the background; the node is invalidated if the origin
/// answers with a different value.
pub struct RemoteComputedFn<K, T> {
    inner: Arc<RemoteFnInner<K, T>>,
}

impl<K, T> Clone for RemoteComputedFn<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for [`RemoteComputedFn`].
pub struct RemoteComputedFnBuilder<K, T> {
    runtime: ComputedRuntime,
    name: &'static str,
    client: Arc<dyn RemoteClient<K, T>>,
    cache: Option<Arc<dyn SnapshotCache>>,
    options: RemoteFnOptions,
}

impl<K, T> RemoteComputedFnBuilder<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Serve cached snapshots from `cache` and keep it up to date.
    pub fn cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the options.
    pub fn options(mut self, options: RemoteFnOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the function.
    pub fn build(self) -> RemoteComputedFn<K, T> {
        RemoteComputedFn {
            inner: Arc::new(RemoteFnInner {
                id: FunctionId::new(self.name),
                runtime: self.runtime,
                client: self.client,
                cache: self.cache,
                options: self.options,
            }),
        }
    }
}

impl<K, T> RemoteComputedFn<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// A function without snapshot cache and with default options.
    pub fn new(runtime: &ComputedRuntime, name: &'static str, client: impl RemoteClient<K, T>) -> Self {
        Self::builder(runtime, name, client).build()
    }

    /// Start building a function.
    pub fn builder(
        runtime: &ComputedRuntime,
        name: &'static str,
        client: impl RemoteClient<K, T>,
    ) -> RemoteComputedFnBuilder<K, T> {
        RemoteComputedFnBuilder {
            runtime: runtime.clone(),
            name,
            client: Arc::new(client),
            cache: None,
            options: RemoteFnOptions::default(),
        }
    }

    /// Identity of this function.
    pub fn id(&self) -> FunctionId {
        self.inner.id
    }

    /// The call identity of `key`.
    pub fn identity(&self, key: K) -> CallIdentity {
        CallIdentity::new(self.inner.id, key)
    }

    /// Get the value for `key`.
    pub async fn get(&self, key: K) -> Result<T, ComputeError> {
        self.computed(key).await?.value()
    }

    /// Get the current consistent node for `key`.
    ///
    /// In invalidation mode the registered node for `key` is invalidated and
    /// [`ComputeError::Invalidating`] is returned.
    pub async fn computed(&self, key: K) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        let identity = self.identity(key.clone());
        let runtime = &self.inner.runtime;

        if Invalidation::is_active() {
            if let Some(node) = runtime.registry().get(&identity) {
                if node.invalidate() {
                    debug!(node = ?identity, "invalidated in invalidation mode");
                }
            }
            return Err(ComputeError::Invalidating);
        }

        if let Some(node) = self.lookup(&identity) {
            return Ok(node);
        }

        let releaser = runtime
            .locks()
            .lock(identity.clone())
            .await
            .map_err(ComputeError::from_lock)?;
        let node = releaser
            .scope(async {
                match self.lookup(&identity) {
                    Some(node) => node,
                    None => self.produce(identity.clone(), key).await,
                }
            })
            .await;
        Ok(node)
    }

    /// Get a node for `key` whose value the origin has acknowledged.
    pub async fn synchronized(&self, key: K) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        loop {
            let node = self.computed(key.clone()).await?;
            if node.is_synchronized() && node.is_consistent() {
                return Ok(node);
            }
            let synchronized = node.when_synchronized();
            let invalidated = node.when_invalidated();
            tokio::select! {
                _ = synchronized => {}
                _ = invalidated => {}
            }
        }
    }

    /// Like [`RemoteComputedFn::computed`], but stop waiting when `cancel`
    /// fires.
    ///
    /// Cancelling only abandons the wait. A call already started keeps
    /// running and its node stays registered for the next reader.
    pub async fn computed_cancellable(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        if Invalidation::is_active() {
            return self.computed(key).await;
        }
        let this = self.clone();
        let flow = LockFlowSnapshot::capture();
        let task = tokio::spawn(async move { flow.scope(this.computed(key)).await });
        Self::until_cancelled(task, cancel).await
    }

    /// Like [`RemoteComputedFn::synchronized`], but stop waiting when
    /// `cancel` fires.
    pub async fn synchronized_cancellable(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        if Invalidation::is_active() {
            return self.synchronized(key).await;
        }
        let this = self.clone();
        let flow = LockFlowSnapshot::capture();
        let task = tokio::spawn(async move { flow.scope(this.synchronized(key)).await });
        Self::until_cancelled(task, cancel).await
    }

    async fn until_cancelled(
        task: tokio::task::JoinHandle<Result<Arc<RemoteComputed<T>>, ComputeError>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ComputeError::Cancelled),
            joined = task => match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(ComputeError::Cancelled),
            },
        }
    }

    /// Invalidate the registered node for `key`.
    pub fn invalidate(&self, key: K) -> bool {
        let identity = self.identity(key);
        self.inner
            .runtime
            .registry()
            .get(&identity)
            .is_some_and(|node| node.invalidate())
    }

    fn lookup(&self, identity: &CallIdentity) -> Option<Arc<RemoteComputed<T>>> {
        let registry = self.inner.runtime.registry();
        let node = registry.try_get(identity)?;
        node.touch();
        registry.record_access(node.as_ref(), true);
        node.as_any_arc().downcast::<RemoteComputed<T>>().ok()
    }

    fn seed(&self, identity: &CallIdentity, key: &K) -> RemoteSeed<T> {
        let runtime = &self.inner.runtime;
        RemoteSeed {
            input: Arc::new(RemoteCall {
                identity: identity.clone(),
                key: key.clone(),
                function: Arc::downgrade(&self.inner),
            }),
            version: runtime.clock().next(),
            options: self.inner.options.computed.clone(),
            fanout: runtime.invalidation_queue().clone(),
        }
    }

    async fn produce(&self, identity: CallIdentity, key: K) -> Arc<RemoteComputed<T>> {
        let runtime = &self.inner.runtime;

        if let Some(cache) = &self.inner.cache {
            if let Some(snapshot) = cache.load(&identity).await {
                match RemoteComputed::from_cache(self.seed(&identity, &key), snapshot) {
                    Ok(node) => {
                        trace!(node = ?identity, "serving cached snapshot");
                        runtime.registry().record_access(node.as_ref(), false);
                        runtime.registry().register(node.clone());
                        self.spawn_bind(&node, identity, key);
                        return node;
                    }
                    Err(err) => {
                        debug!(node = ?identity, error = %err, "dropping undecodable snapshot");
                        cache.remove(&identity).await;
                    }
                }
            }
        }

        let node = match self.start_call(&identity, key.clone()).await {
            Ok(call) => {
                call.completed().wait().await;
                self.store_snapshot(&identity, &call).await;
                RemoteComputed::from_call(self.seed(&identity, &key), call)
            }
            Err(err) => {
                let node = RemoteComputed::from_output(self.seed(&identity, &key), Err(err));
                if let Some(delay) = self.inner.options.computed.error_invalidation_delay {
                    invalidate_after(&node, delay);
                }
                node
            }
        };
        runtime.registry().record_access(node.as_ref(), false);
        runtime.registry().register(node.clone());
        node
    }

    // Attach a call to a node served from the cache. The node stays
    // registered while the origin has not answered; once it has, an
    // invalidated node is removed.
    fn spawn_bind(&self, node: &Arc<RemoteComputed<T>>, identity: CallIdentity, key: K) {
        let this = self.clone();
        let weak = Arc::downgrade(node);
        tokio::spawn(async move {
            let call = match this.start_call(&identity, key).await {
                Ok(call) => Some(call),
                Err(err) => {
                    debug!(node = ?identity, error = %err, "call for cached node failed to start");
                    None
                }
            };
            let Some(node) = weak.upgrade() else {
                if let Some(call) = call {
                    call.dispose();
                }
                return;
            };
            let registry = this.inner.runtime.registry().clone();
            let node_dyn: Arc<dyn ComputedNode> = node.clone();

            let call = match call {
                Some(call) if !node.is_invalidated() => call,
                call => {
                    if let Some(call) = call {
                        call.dispose();
                    }
                    node.bind_to_call(None);
                    registry.unregister(&node_dyn);
                    return;
                }
            };
            if !node.bind_to_call(Some(call.clone())) {
                return;
            }
            drop(node_dyn);
            drop(node);

            // Completion synchronizes the node; dropping the node disposes
            // the call, which completes it as well.
            call.completed().wait().await;
            this.store_snapshot(&identity, &call).await;
            if let Some(node) = weak.upgrade() {
                if node.is_invalidated() {
                    let node: Arc<dyn ComputedNode> = node;
                    registry.unregister(&node);
                }
            }
        });
    }

    async fn start_call(&self, identity: &CallIdentity, key: K) -> Result<SharedCall<T>, ComputeError> {
        let mut try_index = 0u32;
        loop {
            let reroute = match self.inner.client.start_call(key.clone()).await {
                Ok(call) => return Ok(call),
                Err(CallStartError::Failed(err)) => return Err(err),
                Err(CallStartError::Reroute(reroute)) => reroute,
            };
            match self.inner.options.reroute_delays.delay(try_index) {
                RetryDelay::After(delay) => {
                    warn!(
                        call = ?identity,
                        try_index,
                        ?delay,
                        reason = %reroute.reason,
                        "rerouting call"
                    );
                    tokio::time::sleep(delay).await;
                    try_index += 1;
                }
                RetryDelay::LimitExceeded => {
                    warn!(call = ?identity, try_index, reason = %reroute.reason, "reroute limit exceeded");
                    let tries = try_index + 1;
                    return Err(anyhow::Error::new(reroute)
                        .context(format!("call not delivered after {tries} attempts"))
                        .into());
                }
            }
        }
    }

    async fn store_snapshot(&self, identity: &CallIdentity, call: &SharedCall<T>) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        let Some(Ok(value)) = call.result() else {
            return;
        };
        match CachedSnapshot::encode(&value) {
            Ok(snapshot) => cache.store(identity, snapshot).await,
            Err(err) => debug!(node = ?identity, error = %err, "value not cacheable"),
        }
    }
}

fn invalidate_after<T: Clone + Send + Sync + 'static>(node: &Arc<RemoteComputed<T>>, delay: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak = Arc::downgrade(node);
    let invalidated = node.when_invalidated();
    handle.spawn(async move {
        tokio::select! {
            _ = invalidated => {}
            _ = tokio::time::sleep(delay) => {
                if let Some(node) = weak.upgrade() {
                    node.invalidate();
                }
            }
        }
    });
}

#[async_trait]
impl<K, T> ComputedSource<K, T> for RemoteComputedFn<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn node(
        &self,
        key: K,
    ) -> Result<(Arc<dyn ComputedNode>, Result<T, ComputeError>), ComputeError> {
        let node = self.computed(key).await?;
        let output = node.value();
        let node: Arc<dyn ComputedNode> = node;
        Ok((node, output))
    }
}

struct RemoteCall<K, T> {
    identity: CallIdentity,
    key: K,
    function: Weak<RemoteFnInner<K, T>>,
}

#[async_trait]
impl<K, T> RemoteInput<T> for RemoteCall<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    async fn recompute(&self) -> Result<Arc<RemoteComputed<T>>, ComputeError> {
        let inner = self.function.upgrade().ok_or(ComputeError::Disposed)?;
        RemoteComputedFn { inner }.computed(self.key.clone()).await
    }
}

// =============================================================================
// Loopback
// =============================================================================

/// In-process origin serving calls from a local [`ComputedFn`].
///
/// Each call completes with the server node's output and is invalidated
/// when that node is. Disposing a call stops watching the server node.
pub struct LoopbackClient<K, T> {
    server: ComputedFn<K, T>,
    active: Arc<AtomicUsize>,
}

impl<K, T> Clone for LoopbackClient<K, T> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            active: self.active.clone(),
        }
    }
}

impl<K, T> LoopbackClient<K, T> {
    /// Serve calls from `server`.
    pub fn new(server: ComputedFn<K, T>) -> Self {
        Self {
            server,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of calls still watching a server node.
    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveCall(Arc<AtomicUsize>);

impl ActiveCall {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K, T> RemoteClient<K, T> for LoopbackClient<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn start_call(&self, key: K) -> Result<SharedCall<T>, CallStartError> {
        let call = Arc::new(CallHandle::<T>::new());
        let weak = Arc::downgrade(&call);
        let server = self.server.clone();
        let active = ActiveCall::new(self.active.clone());
        let task = tokio::spawn(async move {
            let _active = active;
            let node = match server.computed(key).await {
                Ok(node) => node,
                Err(err) => {
                    if let Some(call) = weak.upgrade() {
                        call.complete(Err(err));
                    }
                    return;
                }
            };
            let invalidated = node.when_invalidated();
            match weak.upgrade() {
                Some(call) => {
                    call.complete(node.value());
                }
                None => return,
            }
            invalidated.await;
            if let Some(call) = weak.upgrade() {
                call.invalidate();
            }
            drop(node);
        });
        call.on_dispose(move || task.abort());
        Ok(call)
    }
}
