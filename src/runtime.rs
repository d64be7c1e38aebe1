//! Computed runtime: shared registry, locks, clock and fan-out queue.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    AsyncLockSet, CallIdentity, ComputeContext, ComputeError, ComputeFunction, ComputedFn,
    ComputedOptions, ComputedRegistry, FnCompute, InvalidationQueue, InvalidationStats,
    LogicalClock, NoopTracer, PruneReport, ReentryMode, RuntimeConfig, Tracer, VersionClock,
};

struct RuntimeInner {
    registry: Arc<ComputedRegistry>,
    locks: AsyncLockSet<CallIdentity>,
    clock: Arc<dyn VersionClock>,
    fanout: InvalidationQueue,
    tracer: Arc<dyn Tracer>,
    config: RuntimeConfig,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if let Some(pruner) = self.pruner.get_mut().take() {
            pruner.abort();
        }
    }
}

/// The computed runtime owns the registry of computed nodes and everything
/// shared between the functions registered on it.
///
/// This is cheap to clone - all data is behind `Arc`.
///
/// # Example
///
/// ```
/// use computed_flow::ComputedRuntime;
///
/// # tokio_test_block_on(async {
/// let runtime = ComputedRuntime::new();
/// let square = runtime.function("square", |_ctx, n: u64| async move { Ok(n * n) });
///
/// assert_eq!(square.get(4).await.unwrap(), 16);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct ComputedRuntime {
    inner: Arc<RuntimeInner>,
}

impl Default for ComputedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputedRuntime {
    /// Create a new runtime with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the runtime.
    ///
    /// # Example
    ///
    /// ```
    /// use computed_flow::{ComputedRuntime, ReentryMode, RuntimeConfig};
    ///
    /// let runtime = ComputedRuntime::builder()
    ///     .config(RuntimeConfig::from_env())
    ///     .reentry_mode(ReentryMode::CheckedFail)
    ///     .build();
    /// # drop(runtime);
    /// ```
    pub fn builder() -> ComputedRuntimeBuilder {
        ComputedRuntimeBuilder::new()
    }

    /// Register a memoized function backed by an async closure.
    ///
    /// The closure receives a [`ComputeContext`]; reads made through it are
    /// recorded as dependencies of the value being computed.
    pub fn function<K, T, F, Fut>(&self, name: &'static str, f: F) -> ComputedFn<K, T>
    where
        K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(ComputeContext, K) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ComputeError>> + Send + 'static,
    {
        self.function_with(name, FnCompute::new(f), self.inner.config.default_options.clone())
    }

    /// Register a memoized function backed by an async closure, with options.
    pub fn function_with_options<K, T, F, Fut>(
        &self,
        name: &'static str,
        options: ComputedOptions,
        f: F,
    ) -> ComputedFn<K, T>
    where
        K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(ComputeContext, K) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ComputeError>> + Send + 'static,
    {
        self.function_with(name, FnCompute::new(f), options)
    }

    /// Register a memoized function backed by a [`ComputeFunction`].
    pub fn function_with<K, T>(
        &self,
        name: &'static str,
        compute: impl ComputeFunction<K, T>,
        options: ComputedOptions,
    ) -> ComputedFn<K, T>
    where
        K: Clone + Hash + Eq + Debug + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        ComputedFn::new(self.clone(), name, Arc::new(compute), options)
    }

    /// The registry of current nodes.
    pub fn registry(&self) -> &Arc<ComputedRegistry> {
        &self.inner.registry
    }

    /// The per-call lock set serializing recomputation.
    pub fn locks(&self) -> &AsyncLockSet<CallIdentity> {
        &self.inner.locks
    }

    /// The clock assigning node versions.
    pub fn clock(&self) -> &Arc<dyn VersionClock> {
        &self.inner.clock
    }

    /// The tracer receiving monitoring events.
    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.inner.tracer
    }

    /// The queue delivering invalidation to dependents.
    pub fn invalidation_queue(&self) -> &InvalidationQueue {
        &self.inner.fanout
    }

    /// The configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Counters of the invalidation fan-out queue.
    pub fn invalidation_stats(&self) -> InvalidationStats {
        self.inner.fanout.stats()
    }

    /// Wait until all pending invalidation has been delivered.
    pub async fn invalidations_settled(&self) {
        self.inner.fanout.settled().await
    }

    /// Run a pruning pass over the registry.
    pub fn prune(&self) -> PruneReport {
        self.inner.registry.prune()
    }

    fn start_pruner(&self, interval: Duration) {
        let Ok(handle) = Handle::try_current() else {
            warn!(
                interval_ms = interval.as_millis() as u64,
                "no tokio runtime, background pruning disabled"
            );
            return;
        };
        let registry = Arc::downgrade(&self.inner.registry);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.prune();
            }
            debug!("pruner stopped");
        });
        *self.inner.pruner.lock() = Some(task);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ComputedRuntime`] with customizable settings.
pub struct ComputedRuntimeBuilder {
    config: RuntimeConfig,
    reentry_mode: ReentryMode,
    tracer: Option<Arc<dyn Tracer>>,
    clock: Option<Arc<dyn VersionClock>>,
}

impl Default for ComputedRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputedRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            reentry_mode: ReentryMode::default(),
            tracer: None,
            clock: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// How nested reads of a call that is already being computed by the same
    /// flow behave. The default, [`ReentryMode::CheckedFail`], reports them
    /// as [`ComputeError::Cycle`].
    pub fn reentry_mode(mut self, mode: ReentryMode) -> Self {
        self.reentry_mode = mode;
        self
    }

    /// Set the tracer receiving monitoring events.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    /// Set a shared tracer receiving monitoring events.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Set the clock assigning node versions.
    pub fn clock(mut self, clock: impl VersionClock) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Forward one in every `n` access and registration events to the tracer.
    pub fn event_sampler(mut self, n: u64) -> Self {
        self.config.sample_every = n;
        self
    }

    /// Capacity of the invalidation fan-out queue, in batches.
    pub fn invalidation_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.invalidation_queue_capacity = capacity;
        self
    }

    /// Run a background pruning pass every `interval`.
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.config.prune_interval = Some(interval);
        self
    }

    /// Options for functions registered without explicit options.
    pub fn default_options(mut self, options: ComputedOptions) -> Self {
        self.config.default_options = options;
        self
    }

    /// Build the runtime with the configured settings.
    ///
    /// The background pruner only starts if the builder runs inside a tokio
    /// runtime.
    pub fn build(self) -> ComputedRuntime {
        let tracer = self.tracer.unwrap_or_else(|| Arc::new(NoopTracer));
        let runtime = ComputedRuntime {
            inner: Arc::new(RuntimeInner {
                registry: Arc::new(ComputedRegistry::new(
                    tracer.clone(),
                    self.config.sample_every,
                )),
                locks: AsyncLockSet::new(self.reentry_mode),
                clock: self.clock.unwrap_or_else(|| Arc::new(LogicalClock::new())),
                fanout: InvalidationQueue::new(self.config.invalidation_queue_capacity),
                tracer,
                config: self.config,
                pruner: Mutex::new(None),
            }),
        };
        if let Some(interval) = runtime.inner.config.prune_interval {
            runtime.start_pruner(interval);
        }
        runtime
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<ComputedRuntime>();
    assert_sync::<ComputedRuntime>();
}
