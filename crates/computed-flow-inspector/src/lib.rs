//! Event collection and inspection for computed-flow.
//!
//! [`EventSinkTracer`] implements [`computed_flow::Tracer`] and turns each
//! callback into a [`FlowEvent`] delivered to an [`EventSink`]:
//!
//! - [`EventCollector`] keeps events in memory for assertions
//! - [`LogSink`] logs them through `tracing`
//! - [`MultiplexSink`] and [`FilterSink`] combine and narrow other sinks
//!
//! # Quick Start
//!
//! ```
//! use computed_flow::{ComputeError, ComputedRuntime};
//! use computed_flow_inspector::{EventCollector, EventSinkTracer, ExecutionResult, FlowEvent};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let collector = Arc::new(EventCollector::new());
//! let runtime = ComputedRuntime::builder()
//!     .tracer(EventSinkTracer::new(collector.clone()))
//!     .build();
//!
//! let square = runtime.function("square", |_ctx, n: u64| async move {
//!     Ok::<_, ComputeError>(n * n)
//! });
//! assert_eq!(square.get(3).await.unwrap(), 9);
//!
//! let trace = collector.trace();
//! assert!(trace.has_event(|e| matches!(
//!     e,
//!     FlowEvent::ComputeEnd { result: ExecutionResult::Computed, .. }
//! )));
//! # });
//! ```
//!
//! Traces serialize to JSON lines with [`ExecutionTrace::to_json_lines`], so
//! a session can be saved and inspected later.

mod collector;
mod events;
mod sink;
mod tracer_impl;

pub use collector::EventCollector;
pub use events::{to_kinds, EventKind, ExecutionResult, ExecutionTrace, FlowEvent, NodeKey};
pub use sink::{EventSink, FilterSink, LogSink, MultiplexSink, NullSink};
pub use tracer_impl::{EventSinkTracer, DEFAULT_MAX_OPEN_SPANS};
