//! Event sink trait and implementations.
//!
//! The `EventSink` trait defines the interface for receiving flow events.
//! Implementations can collect events for testing, filter them, or forward
//! them to the `tracing` crate.

use std::sync::Arc;

use tracing::Level;

use crate::events::FlowEvent;

/// Trait for receiving flow events.
///
/// # Example
///
/// ```
/// use computed_flow_inspector::{EventSink, FlowEvent};
///
/// struct PrintSink;
///
/// impl EventSink for PrintSink {
///     fn emit(&self, event: FlowEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait EventSink: Send + Sync + 'static {
    /// Called when an event occurs. Events arrive from every task touching
    /// the runtime.
    fn emit(&self, event: FlowEvent);

    /// Flush buffered events. The default implementation does nothing.
    fn flush(&self) {}
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: FlowEvent) {
        (**self).emit(event);
    }

    fn flush(&self) {
        (**self).flush();
    }
}

/// Null sink that discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: FlowEvent) {}
}

/// A sink that forwards events to multiple child sinks.
pub struct MultiplexSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiplexSink {
    /// Forward every event to each of `sinks`, in order.
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for MultiplexSink {
    fn emit(&self, event: FlowEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}

/// A sink that filters events before forwarding.
pub struct FilterSink<F, S>
where
    F: Fn(&FlowEvent) -> bool + Send + Sync + 'static,
    S: EventSink,
{
    filter: F,
    inner: S,
}

impl<F, S> FilterSink<F, S>
where
    F: Fn(&FlowEvent) -> bool + Send + Sync + 'static,
    S: EventSink,
{
    /// Forward the events for which `filter` returns true to `inner`.
    pub fn new(filter: F, inner: S) -> Self {
        Self { filter, inner }
    }

    /// The sink receiving the accepted events.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<F, S> EventSink for FilterSink<F, S>
where
    F: Fn(&FlowEvent) -> bool + Send + Sync + 'static,
    S: EventSink,
{
    fn emit(&self, event: FlowEvent) {
        if (self.filter)(&event) {
            self.inner.emit(event);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// A sink that logs every event through `tracing`.
///
/// Events are logged under the `computed_flow::events` target. Reads and
/// registrations log at `TRACE`, computations and pruning at the level given
/// to [`LogSink::new`].
pub struct LogSink {
    level: Level,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl LogSink {
    /// Log computations and pruning at `level`.
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn level_of(&self, event: &FlowEvent) -> Level {
        match event {
            FlowEvent::Access { .. }
            | FlowEvent::Registered { .. }
            | FlowEvent::Unregistered { .. }
            | FlowEvent::DependencyRegistered { .. } => Level::TRACE,
            FlowEvent::ComputeEnd {
                result: crate::ExecutionResult::Error { .. },
                ..
            } => Level::WARN.min(self.level),
            _ => self.level,
        }
    }
}

macro_rules! log_at {
    ($level:expr, $($args:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!(target: "computed_flow::events", $($args)+),
            Level::WARN => tracing::warn!(target: "computed_flow::events", $($args)+),
            Level::INFO => tracing::info!(target: "computed_flow::events", $($args)+),
            Level::DEBUG => tracing::debug!(target: "computed_flow::events", $($args)+),
            _ => tracing::trace!(target: "computed_flow::events", $($args)+),
        }
    };
}

impl EventSink for LogSink {
    fn emit(&self, event: FlowEvent) {
        let level = self.level_of(&event);
        match &event {
            FlowEvent::ComputeEnd {
                node,
                result,
                duration,
                ..
            } => log_at!(level, node = %node, ?result, ?duration, "compute_end"),
            FlowEvent::DependencyRegistered { parent, dependency } => {
                log_at!(level, parent = %parent, dependency = %dependency, "dependency_registered")
            }
            FlowEvent::Pruned { report } => log_at!(
                level,
                scanned = report.scanned,
                removed_invalidated = report.removed_invalidated,
                removed_unreferenced = report.removed_unreferenced,
                "pruned"
            ),
            other => match other.node() {
                Some(node) => log_at!(level, node = %node, event = other.name()),
                None => log_at!(level, event = other.name()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NodeKey;
    use computed_flow::{PruneReport, SpanId, Version};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink {
        count: AtomicU32,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                count: AtomicU32::new(0),
            }
        }

        fn count(&self) -> u32 {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl EventSink for CountingSink {
        fn emit(&self, _event: FlowEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start() -> FlowEvent {
        FlowEvent::ComputeStart {
            span_id: SpanId(1),
            node: NodeKey::new("test", "()"),
            version: Version(1),
        }
    }

    #[test]
    fn test_multiplex_sink() {
        let sink1 = Arc::new(CountingSink::new());
        let sink2 = Arc::new(CountingSink::new());
        let multiplex = MultiplexSink::new(vec![Box::new(sink1.clone()), Box::new(sink2.clone())]);

        multiplex.emit(start());

        assert_eq!(sink1.count(), 1);
        assert_eq!(sink2.count(), 1);
    }

    #[test]
    fn test_filter_sink() {
        let filter_sink = FilterSink::new(
            |e| matches!(e, FlowEvent::ComputeStart { .. }),
            CountingSink::new(),
        );

        filter_sink.emit(start());
        filter_sink.emit(FlowEvent::Pruned {
            report: PruneReport::default(),
        });

        assert_eq!(filter_sink.inner().count(), 1);
    }

    #[test]
    fn test_log_sink_levels() {
        let sink = LogSink::new(Level::INFO);
        assert_eq!(sink.level_of(&start()), Level::INFO);
        let access = FlowEvent::Access {
            node: NodeKey::new("test", "()"),
            version: Version(1),
            was_hit: true,
        };
        assert_eq!(sink.level_of(&access), Level::TRACE);
        let failed = FlowEvent::ComputeEnd {
            span_id: SpanId(1),
            node: NodeKey::new("test", "()"),
            version: Version(1),
            result: crate::ExecutionResult::Error {
                message: "boom".into(),
            },
            duration: std::time::Duration::ZERO,
        };
        assert_eq!(sink.level_of(&failed), Level::WARN);
        // Emitting without a subscriber is a no-op.
        sink.emit(failed);
    }
}
