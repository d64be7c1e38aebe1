//! Computed-Flow: transparent, automatically-invalidated memoization of async
//! compute functions.
//!
//! Register an async function on a [`ComputedRuntime`] and get a
//! [`ComputedFn`] back. Reads are cached per call identity; a value read
//! while computing another one is recorded as its dependency, and
//! invalidating it invalidates everything computed from it.
//!
//! # Key Features
//!
//! - **No duplicate work**: concurrent first reads of one key run the function once
//! - **Dependency tracking**: reads made through [`ComputeContext::get`] link nodes
//! - **Invalidation mode**: write paths "read" the keys they made stale to invalidate them
//! - **Lazy errors**: failures are cached as the node output and surface on [`Computed::value`]
//! - **Observability**: the [`Tracer`] trait receives sampled access and registration events
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use computed_flow::{ComputeError, ComputedRuntime, Invalidation};
//! use parking_lot::Mutex;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let counters = Arc::new(Mutex::new(HashMap::<String, i64>::new()));
//! let runtime = ComputedRuntime::new();
//!
//! let store = counters.clone();
//! let get = runtime.function("counter.get", move |_ctx, key: String| {
//!     let store = store.clone();
//!     async move { Ok::<_, ComputeError>(store.lock().get(&key).copied().unwrap_or(0)) }
//! });
//!
//! let node = get.computed("a".to_string()).await.unwrap();
//! assert_eq!(node.value().unwrap(), 0);
//!
//! *counters.lock().entry("a".to_string()).or_default() += 1;
//! let _ = Invalidation::scope(get.computed("a".to_string())).await;
//!
//! assert!(node.is_invalidated());
//! assert_eq!(node.update().await.unwrap().value().unwrap(), 1);
//! # });
//! ```
//!
//! # Memory
//!
//! Dependents are held weakly and the registry keeps one strong reference per
//! entry. [`ComputedRuntime::prune`] (or a background pruner configured with
//! [`ComputedRuntimeBuilder::prune_interval`]) drops entries nothing else
//! refers to.
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod fanout;
mod function;
mod identity;
mod invalidation;
mod lock;
mod node;
mod registry;
mod runtime;
mod signal;
pub mod tracer;
mod version;

pub use config::{ComputedOptions, RuntimeConfig, DEFAULT_QUEUE_CAPACITY};
pub use context::ComputeContext;
pub use error::{ComputeError, ComputeResultExt, TypedErr};
pub use fanout::{InvalidationQueue, InvalidationStats};
pub use function::{ComputeFunction, ComputedFn, ComputedSource, FnCompute};
pub use identity::{CacheKey, CallIdentity, DynEq, FunctionId, Ignored};
pub use invalidation::{Invalidation, InvalidationScope};
pub use lock::{AsyncLockSet, LockError, LockFlowSnapshot, LockReleaser, ReentryMode};
pub use node::{ComputedInput, Computed, ComputedNode, ConsistencyState};
pub use registry::{ComputedRegistry, PruneReport};
pub use runtime::{ComputedRuntime, ComputedRuntimeBuilder};
pub use signal::{Signal, Subscription};
pub use tracer::{EventSampler, ExecutionResult, NodeInfo, NoopTracer, SpanId, Tracer};
pub use version::{LogicalClock, Version, VersionClock};
