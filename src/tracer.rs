//! Tracer trait for observing computed-flow execution.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! cache accesses, registrations and computations. The default [`NoopTracer`]
//! discards everything. Events are informational only: nothing in the
//! runtime depends on a tracer observing them.
//!
//! # Example
//!
//! ```
//! use computed_flow::{ComputedRuntime, NodeInfo, SpanId, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(1)
//!     }
//!
//!     fn on_access(&self, node: &NodeInfo, was_hit: bool) {
//!         println!("{}({}) hit={}", node.function, node.args_debug, was_hit);
//!     }
//! }
//!
//! let runtime = ComputedRuntime::builder().tracer(PrintTracer).build();
//! # drop(runtime);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{ComputedNode, ConsistencyState, PruneReport, Version};

/// Unique identifier for one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpanId(pub u64);

/// Type-erased description of a node for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    /// Name of the function the node belongs to.
    pub function: &'static str,
    /// Debug representation of the call arguments.
    pub args_debug: String,
    /// Version of the node.
    pub version: Version,
    /// Consistency state when the event was emitted.
    pub state: ConsistencyState,
}

impl NodeInfo {
    /// Describe `node`.
    pub fn of(node: &dyn ComputedNode) -> Self {
        let identity = node.identity();
        Self {
            function: identity.function().name(),
            args_debug: identity.args_debug(),
            version: node.version(),
            state: node.state(),
        }
    }
}

/// How a computation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The node got a value and became consistent.
    Computed,
    /// The node captured an error and became consistent.
    Error {
        /// Display of the captured error.
        message: String,
    },
    /// The node was invalidated before the computation finished.
    Superseded,
}

/// Tracer trait for observing computed-flow execution.
///
/// All methods except [`Tracer::new_span_id`] have empty default
/// implementations, so you only need to override the events you're
/// interested in.
///
/// Implementations must be `Send + Sync`; events arrive from every task
/// that touches the runtime.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID. Called once per computation.
    fn new_span_id(&self) -> SpanId;

    /// Called for sampled reads. `was_hit` is true if a consistent node was
    /// found without computing.
    #[inline]
    fn on_access(&self, _node: &NodeInfo, _was_hit: bool) {}

    /// Called for sampled registrations.
    #[inline]
    fn on_register(&self, _node: &NodeInfo) {}

    /// Called for sampled unregistrations. `pseudo` is true if the entry was
    /// kept in the registry because it still waits for an acknowledgement.
    #[inline]
    fn on_unregister(&self, _node: &NodeInfo, _pseudo: bool) {}

    /// Called when a computation starts.
    #[inline]
    fn on_compute_start(&self, _span_id: SpanId, _node: &NodeInfo) {}

    /// Called when a computation ends.
    #[inline]
    fn on_compute_end(&self, _span_id: SpanId, _node: &NodeInfo, _result: ExecutionResult) {}

    /// Called when a computation records a dependency.
    #[inline]
    fn on_dependency_registered(&self, _parent: &NodeInfo, _dependency: &NodeInfo) {}

    /// Called after a pruning pass.
    #[inline]
    fn on_pruned(&self, _report: &PruneReport) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`ComputedRuntime`](crate::ComputedRuntime).
pub struct NoopTracer;

/// Global span counter for NoopTracer.
static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Decides which monitoring events are forwarded to the tracer.
#[derive(Debug)]
pub struct EventSampler {
    every: u64,
    counter: AtomicU64,
}

impl EventSampler {
    /// Forward every event.
    pub fn always() -> Self {
        Self::every_nth(1)
    }

    /// Forward nothing.
    pub fn never() -> Self {
        Self::every_nth(0)
    }

    /// Forward one event out of `n`. `0` forwards nothing.
    pub fn every_nth(n: u64) -> Self {
        Self {
            every: n,
            counter: AtomicU64::new(0),
        }
    }

    /// Returns true if the next event should be forwarded.
    pub fn sample(&self) -> bool {
        match self.every {
            0 => false,
            1 => true,
            n => self.counter.fetch_add(1, Ordering::Relaxed) % n == 0,
        }
    }
}
