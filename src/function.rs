//! Memoizing wrappers around async compute functions.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    CallIdentity, ComputeContext, ComputeError, Computed, ComputedInput, ComputedNode,
    ComputedOptions, ComputedRuntime, ExecutionResult, FunctionId, Invalidation, LockFlowSnapshot,
    NodeInfo, Version,
};

/// The function behind a [`ComputedFn`].
#[async_trait]
pub trait ComputeFunction<K, T>: Send + Sync + 'static {
    /// Compute the value for `key`. Reads made through `ctx` become
    /// dependencies of the result.
    async fn compute(&self, ctx: &ComputeContext, key: K) -> Result<T, ComputeError>;
}

/// Adapter turning an async closure into a [`ComputeFunction`].
pub struct FnCompute<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnCompute<F, Fut> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K, T, F, Fut> ComputeFunction<K, T> for FnCompute<F, Fut>
where
    K: Send + 'static,
    T: Send + 'static,
    F: Fn(ComputeContext, K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ComputeError>> + Send + 'static,
{
    async fn compute(&self, ctx: &ComputeContext, key: K) -> Result<T, ComputeError> {
        (self.f)(ctx.clone(), key).await
    }
}

/// Anything a compute function can read through a [`ComputeContext`].
#[async_trait]
pub trait ComputedSource<K, T>: Send + Sync {
    /// Resolve the current node for `key` together with its output.
    async fn node(
        &self,
        key: K,
    ) -> Result<(Arc<dyn ComputedNode>, Result<T, ComputeError>), ComputeError>;
}

pub(crate) struct FunctionInner<K, T> {
    id: FunctionId,
    runtime: ComputedRuntime,
    compute: Arc<dyn ComputeFunction<K, T>>,
    options: ComputedOptions,
}

/// A memoized async function.
///
/// Every distinct key is computed at most once at a time; the result is
/// cached in the runtime registry until it is invalidated, either directly,
/// through invalidation mode, or because a dependency was invalidated.
///
/// This is cheap to clone.
pub struct ComputedFn<K, T> {
    inner: Arc<FunctionInner<K, T>>,
}

impl<K, T> Clone for ComputedFn<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> ComputedFn<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        runtime: ComputedRuntime,
        name: &'static str,
        compute: Arc<dyn ComputeFunction<K, T>>,
        options: ComputedOptions,
    ) -> Self {
        Self {
            inner: Arc::new(FunctionInner {
                id: FunctionId::new(name),
                runtime,
                compute,
                options,
            }),
        }
    }

    /// Identity of this function.
    pub fn id(&self) -> FunctionId {
        self.inner.id
    }

    /// The runtime this function is registered on.
    pub fn runtime(&self) -> &ComputedRuntime {
        &self.inner.runtime
    }

    /// The call identity of `key`.
    pub fn identity(&self, key: K) -> CallIdentity {
        CallIdentity::new(self.inner.id, key)
    }

    /// Get the value for `key`, computing it if needed.
    pub async fn get(&self, key: K) -> Result<T, ComputeError> {
        self.computed(key).await?.value()
    }

    /// Like [`ComputedFn::get`], but stop waiting when `cancel` fires.
    ///
    /// Cancelling only abandons the wait. The computation keeps running and
    /// its result is cached for the next reader.
    pub async fn get_cancellable(&self, key: K, cancel: &CancellationToken) -> Result<T, ComputeError> {
        if Invalidation::is_active() {
            return self.get(key).await;
        }
        let this = self.clone();
        let flow = LockFlowSnapshot::capture();
        let task = tokio::spawn(async move { flow.scope(this.get(key)).await });
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

    /// Get the current consistent node for `key`, computing it if needed.
    ///
    /// In invalidation mode nothing is computed: the registered node for
    /// `key` (if any) is invalidated and [`ComputeError::Invalidating`] is
    /// returned.
    pub async fn computed(&self, key: K) -> Result<Arc<Computed<T>>, ComputeError> {
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
                    None => self.compute_node(identity.clone(), key).await,
                }
            })
            .await;
        Ok(node)
    }

    /// Get a node for `key` whose version is newer than `version`, waiting
    /// for the current one to be invalidated if necessary.
    pub async fn computed_newer_than(
        &self,
        key: K,
        version: Version,
    ) -> Result<Arc<Computed<T>>, ComputeError> {
        loop {
            let node = self.computed(key.clone()).await?;
            if node.version().is_newer_than(version) {
                return Ok(node);
            }
            node.when_invalidated().await;
        }
    }

    /// Invalidate the registered node for `key`. Returns true if a node was
    /// invalidated by this call.
    pub fn invalidate(&self, key: K) -> bool {
        let identity = self.identity(key);
        self.inner
            .runtime
            .registry()
            .get(&identity)
            .is_some_and(|node| node.invalidate())
    }

    fn lookup(&self, identity: &CallIdentity) -> Option<Arc<Computed<T>>> {
        let registry = self.inner.runtime.registry();
        let node = registry.try_get(identity)?;
        node.touch();
        registry.record_access(node.as_ref(), true);
        node.as_any_arc().downcast::<Computed<T>>().ok()
    }

    async fn compute_node(&self, identity: CallIdentity, key: K) -> Arc<Computed<T>> {
        let runtime = &self.inner.runtime;
        let input: Arc<dyn ComputedInput<T>> = Arc::new(FunctionCall {
            identity: identity.clone(),
            key: key.clone(),
            function: Arc::downgrade(&self.inner),
        });
        let node = Arc::new(Computed::new(
            input,
            runtime.clock().next(),
            &self.inner.options,
            runtime.invalidation_queue().clone(),
        ));
        let node_dyn: Arc<dyn ComputedNode> = node.clone();
        runtime.registry().record_access(node.as_ref(), false);

        let tracer = runtime.tracer();
        let span_id = tracer.new_span_id();
        tracer.on_compute_start(span_id, &NodeInfo::of(node.as_ref()));
        trace!(node = ?identity, version = node.version().0, "computing");

        let ctx = ComputeContext::new(runtime.clone(), node_dyn.clone());
        let mut output = Invalidation::suspend(self.inner.compute.compute(&ctx, key)).await;
        if let Err(ComputeError::Cycle { path }) = &mut output {
            let closed = path.len() > 1 && path.first() == path.last();
            if !closed {
                path.push(identity.debug_repr());
            }
        }

        let result = match &output {
            Ok(_) => ExecutionResult::Computed,
            Err(err) => ExecutionResult::Error {
                message: err.to_string(),
            },
        };
        let delay = match &output {
            Ok(_) => self.inner.options.auto_invalidation_delay,
            Err(_) => self.inner.options.error_invalidation_delay,
        };

        if node.try_set_output(output) {
            runtime.registry().register(node_dyn);
            if let Some(delay) = delay {
                schedule_invalidation(&node, delay);
            }
            tracer.on_compute_end(span_id, &NodeInfo::of(node.as_ref()), result);
        } else {
            debug!(node = ?identity, "invalidated while computing");
            tracer.on_compute_end(
                span_id,
                &NodeInfo::of(node.as_ref()),
                ExecutionResult::Superseded,
            );
        }
        node
    }
}

fn schedule_invalidation<T: Clone + Send + Sync + 'static>(node: &Arc<Computed<T>>, delay: Duration) {
    let Ok(handle) = Handle::try_current() else {
        debug!(node = ?node.identity(), "no tokio runtime, delayed invalidation skipped");
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
impl<K, T> ComputedSource<K, T> for ComputedFn<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
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

struct FunctionCall<K, T> {
    identity: CallIdentity,
    key: K,
    function: Weak<FunctionInner<K, T>>,
}

#[async_trait]
impl<K, T> ComputedInput<T> for FunctionCall<K, T>
where
    K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    async fn recompute(&self) -> Result<Arc<Computed<T>>, ComputeError> {
        let inner = self.function.upgrade().ok_or(ComputeError::Disposed)?;
        ComputedFn { inner }.computed(self.key.clone()).await
    }
}
