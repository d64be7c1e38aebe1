//! Event collector for tests and debugging sessions.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::events::{ExecutionTrace, FlowEvent};
use crate::sink::EventSink;

/// Accumulates events for later inspection and assertion.
///
/// An unbounded collector keeps everything. A bounded one keeps the most
/// recent `capacity` events and counts the ones it dropped.
///
/// # Example
///
/// ```
/// use computed_flow::ComputedRuntime;
/// use computed_flow_inspector::{EventCollector, EventSinkTracer};
/// use std::sync::Arc;
///
/// let collector = Arc::new(EventCollector::new());
/// let runtime = ComputedRuntime::builder()
///     .tracer(EventSinkTracer::new(collector.clone()))
///     .build();
/// # drop(runtime);
/// assert!(collector.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct EventCollector {
    state: Mutex<State>,
    capacity: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    events: VecDeque<FlowEvent>,
    dropped: u64,
}

impl EventCollector {
    /// Create a new unbounded collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collector keeping at most `capacity` recent events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            capacity: Some(capacity),
        }
    }

    /// Get collected events as an execution trace.
    pub fn trace(&self) -> ExecutionTrace {
        ExecutionTrace {
            events: self.events(),
        }
    }

    /// Get collected events as a vector.
    pub fn events(&self) -> Vec<FlowEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        state.dropped = 0;
    }

    /// Take collected events, clearing the collector.
    pub fn take(&self) -> Vec<FlowEvent> {
        let mut state = self.state.lock();
        state.dropped = 0;
        std::mem::take(&mut state.events).into()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    /// Events discarded because the collector was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

impl EventSink for EventCollector {
    fn emit(&self, event: FlowEvent) {
        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            if capacity == 0 {
                state.dropped += 1;
                return;
            }
            if state.events.len() >= capacity {
                state.events.pop_front();
                state.dropped += 1;
            }
        }
        state.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NodeKey;
    use computed_flow::{SpanId, Version};

    fn start(span: u64) -> FlowEvent {
        FlowEvent::ComputeStart {
            span_id: SpanId(span),
            node: NodeKey::new("test", "()"),
            version: Version(span),
        }
    }

    #[test]
    fn test_collector_basic() {
        let collector = EventCollector::new();
        assert!(collector.is_empty());

        collector.emit(start(1));
        collector.emit(start(2));

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.trace().events.len(), 2);
    }

    #[test]
    fn test_collector_clear_and_take() {
        let collector = EventCollector::new();
        collector.emit(start(1));
        collector.clear();
        assert!(collector.is_empty());

        collector.emit(start(2));
        let events = collector.take();
        assert_eq!(events, vec![start(2)]);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_bounded_collector_keeps_recent() {
        let collector = EventCollector::with_capacity(2);
        for span in 1..=5 {
            collector.emit(start(span));
        }
        assert_eq!(collector.events(), vec![start(4), start(5)]);
        assert_eq!(collector.dropped(), 3);
    }
}
