//! Context handed to compute functions.

use std::sync::Arc;

use crate::{CallIdentity, ComputeError, ComputedNode, ComputedRuntime, ComputedSource, NodeInfo};

/// Execution context of one computation.
///
/// Reads made through [`ComputeContext::get`] are recorded as dependencies of
/// the node being computed, so invalidating any of them invalidates it too.
#[derive(Clone)]
pub struct ComputeContext {
    runtime: ComputedRuntime,
    node: Arc<dyn ComputedNode>,
}

impl ComputeContext {
    pub(crate) fn new(runtime: ComputedRuntime, node: Arc<dyn ComputedNode>) -> Self {
        Self { runtime, node }
    }

    /// Read `key` from `source` and record the read as a dependency.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let total = runtime.function("total", move |ctx, ids: Vec<u32>| {
    ///     let price = price.clone();
    ///     async move {
    ///         let mut sum = 0;
    ///         for id in ids {
    ///             sum += ctx.get(&price, id).await?;
    ///         }
    ///         Ok(sum)
    ///     }
    /// });
    /// ```
    pub async fn get<K, T, S>(&self, source: &S, key: K) -> Result<T, ComputeError>
    where
        K: Send + 'static,
        T: Send + 'static,
        S: ComputedSource<K, T> + ?Sized,
    {
        let (dependency, output) = source.node(key).await?;
        self.record_dependency(dependency);
        output
    }

    /// Record `dependency` as read by the node being computed.
    pub fn record_dependency(&self, dependency: Arc<dyn ComputedNode>) {
        let tracer = self.runtime.tracer();
        tracer.on_dependency_registered(
            &NodeInfo::of(self.node.as_ref()),
            &NodeInfo::of(dependency.as_ref()),
        );
        dependency.add_dependent(Arc::downgrade(&self.node));
        self.node.add_dependency(dependency);
    }

    /// The call being computed.
    pub fn identity(&self) -> &CallIdentity {
        self.node.identity()
    }

    /// The node being computed.
    pub fn node(&self) -> &Arc<dyn ComputedNode> {
        &self.node
    }

    /// The runtime the computation runs on.
    pub fn runtime(&self) -> &ComputedRuntime {
        &self.runtime
    }

    /// True if the node being computed was already invalidated, in which
    /// case its result will not be cached.
    pub fn is_invalidated(&self) -> bool {
        self.node.is_invalidated()
    }
}
