//! Bridge between the computed-flow [`Tracer`] and an [`EventSink`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use computed_flow::{ExecutionResult as TracerExecutionResult, NodeInfo, PruneReport, SpanId, Tracer};
use parking_lot::Mutex;

use crate::events::FlowEvent;
use crate::sink::EventSink;

/// Default bound on spans started but not yet ended.
pub const DEFAULT_MAX_OPEN_SPANS: usize = 4096;

/// Global span ID counter for EventSinkTracer.
static SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A [`Tracer`] that turns every callback into a [`FlowEvent`] and hands it
/// to an [`EventSink`].
///
/// Computation durations are measured between `on_compute_start` and
/// `on_compute_end` of the same span.
pub struct EventSinkTracer {
    sink: Arc<dyn EventSink>,
    // Keyed by span number; span ids only grow, so the first entry is the oldest.
    start_times: Mutex<BTreeMap<u64, Instant>>,
    max_open_spans: usize,
}

impl EventSinkTracer {
    /// Create a new EventSinkTracer wrapping the given sink.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_max_open_spans(sink, DEFAULT_MAX_OPEN_SPANS)
    }

    /// Like [`EventSinkTracer::new`], but remember at most `max` start times.
    ///
    /// A computation whose future is dropped never reports its end. Once the
    /// bound is reached the oldest start time is forgotten, and that span
    /// ends with a zero duration if it ever does.
    pub fn with_max_open_spans(sink: Arc<dyn EventSink>, max: usize) -> Self {
        Self {
            sink,
            start_times: Mutex::new(BTreeMap::new()),
            max_open_spans: max.max(1),
        }
    }

    /// Spans started but not yet ended.
    pub fn open_spans(&self) -> usize {
        self.start_times.lock().len()
    }
}

impl Tracer for EventSinkTracer {
    #[inline]
    fn new_span_id(&self) -> SpanId {
        SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn on_access(&self, node: &NodeInfo, was_hit: bool) {
        self.sink.emit(FlowEvent::Access {
            node: node.into(),
            version: node.version,
            was_hit,
        });
    }

    fn on_register(&self, node: &NodeInfo) {
        self.sink.emit(FlowEvent::Registered {
            node: node.into(),
            version: node.version,
        });
    }

    fn on_unregister(&self, node: &NodeInfo, pseudo: bool) {
        self.sink.emit(FlowEvent::Unregistered {
            node: node.into(),
            version: node.version,
            pseudo,
        });
    }

    fn on_compute_start(&self, span_id: SpanId, node: &NodeInfo) {
        {
            let mut start_times = self.start_times.lock();
            while start_times.len() >= self.max_open_spans {
                start_times.pop_first();
            }
            start_times.insert(span_id.0, Instant::now());
        }
        self.sink.emit(FlowEvent::ComputeStart {
            span_id,
            node: node.into(),
            version: node.version,
        });
    }

    fn on_compute_end(&self, span_id: SpanId, node: &NodeInfo, result: TracerExecutionResult) {
        let duration = self
            .start_times
            .lock()
            .remove(&span_id.0)
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO);
        self.sink.emit(FlowEvent::ComputeEnd {
            span_id,
            node: node.into(),
            version: node.version,
            result: result.into(),
            duration,
        });
    }

    fn on_dependency_registered(&self, parent: &NodeInfo, dependency: &NodeInfo) {
        self.sink.emit(FlowEvent::DependencyRegistered {
            parent: parent.into(),
            dependency: dependency.into(),
        });
    }

    fn on_pruned(&self, report: &PruneReport) {
        self.sink.emit(FlowEvent::Pruned { report: *report });
        self.sink.flush();
    }
}
