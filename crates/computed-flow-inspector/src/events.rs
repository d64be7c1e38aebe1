//! Event types for flow tracing.
//!
//! [`FlowEvent`] is the owned, serializable counterpart of the callbacks of
//! [`computed_flow::Tracer`]. [`EventKind`] drops the volatile parts of an
//! event (span ids, versions, durations) so traces can be compared in tests.

use std::time::Duration;

use computed_flow::{NodeInfo, PruneReport, SpanId, Version};
use serde::{Deserialize, Serialize};

/// Identifies a node by function name and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    /// Function name, e.g. `"users.get"`.
    pub function: String,
    /// Debug representation of the call arguments.
    pub args_debug: String,
}

impl NodeKey {
    /// Create a new node key.
    pub fn new(function: impl Into<String>, args_debug: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args_debug: args_debug.into(),
        }
    }
}

impl From<&NodeInfo> for NodeKey {
    fn from(info: &NodeInfo) -> Self {
        Self::new(info.function, info.args_debug.clone())
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.function, self.args_debug)
    }
}

/// How a computation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// The node got a value.
    Computed,
    /// The node captured an error.
    Error {
        /// Display of the error.
        message: String,
    },
    /// The node was invalidated before the computation finished.
    Superseded,
}

impl From<computed_flow::ExecutionResult> for ExecutionResult {
    fn from(result: computed_flow::ExecutionResult) -> Self {
        match result {
            computed_flow::ExecutionResult::Computed => Self::Computed,
            computed_flow::ExecutionResult::Error { message } => Self::Error { message },
            computed_flow::ExecutionResult::Superseded => Self::Superseded,
        }
    }
}

/// A single recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A node was read.
    Access {
        node: NodeKey,
        version: Version,
        /// True if a consistent node was found without computing.
        was_hit: bool,
    },
    /// A node became the current node of its call.
    Registered { node: NodeKey, version: Version },
    /// A node stopped being the current node of its call.
    Unregistered {
        node: NodeKey,
        version: Version,
        /// True if the entry stays until a pending acknowledgement settles.
        pseudo: bool,
    },
    /// A computation started.
    ComputeStart {
        span_id: SpanId,
        node: NodeKey,
        version: Version,
    },
    /// A computation ended.
    ComputeEnd {
        span_id: SpanId,
        node: NodeKey,
        version: Version,
        result: ExecutionResult,
        duration: Duration,
    },
    /// A computation read another node.
    DependencyRegistered { parent: NodeKey, dependency: NodeKey },
    /// A pruning pass finished.
    Pruned { report: PruneReport },
}

impl FlowEvent {
    /// The node this event is about, if any. For dependency events this is
    /// the parent.
    pub fn node(&self) -> Option<&NodeKey> {
        match self {
            FlowEvent::Access { node, .. }
            | FlowEvent::Registered { node, .. }
            | FlowEvent::Unregistered { node, .. }
            | FlowEvent::ComputeStart { node, .. }
            | FlowEvent::ComputeEnd { node, .. } => Some(node),
            FlowEvent::DependencyRegistered { parent, .. } => Some(parent),
            FlowEvent::Pruned { .. } => None,
        }
    }

    /// Short name of the event variant, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::Access { .. } => "access",
            FlowEvent::Registered { .. } => "registered",
            FlowEvent::Unregistered { .. } => "unregistered",
            FlowEvent::ComputeStart { .. } => "compute_start",
            FlowEvent::ComputeEnd { .. } => "compute_end",
            FlowEvent::DependencyRegistered { .. } => "dependency_registered",
            FlowEvent::Pruned { .. } => "pruned",
        }
    }
}

/// A sequence of recorded events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub events: Vec<FlowEvent>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    /// Events about nodes of `function`.
    pub fn events_for_function(&self, function: &str) -> Vec<&FlowEvent> {
        self.events
            .iter()
            .filter(|e| e.node().is_some_and(|n| n.function == function))
            .collect()
    }

    /// Nodes whose computation started, in order.
    pub fn computed_nodes(&self) -> Vec<&NodeKey> {
        self.events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::ComputeStart { node, .. } => Some(node),
                _ => None,
            })
            .collect()
    }

    /// Number of reads answered from a consistent node.
    pub fn hits(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, FlowEvent::Access { was_hit: true, .. }))
            .count()
    }

    /// Number of reads that had to compute.
    pub fn misses(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, FlowEvent::Access { was_hit: false, .. }))
            .count()
    }

    pub fn has_event(&self, predicate: impl Fn(&FlowEvent) -> bool) -> bool {
        self.events.iter().any(predicate)
    }

    /// Serialize the trace as JSON lines, one event per line.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse a trace written by [`ExecutionTrace::to_json_lines`].
    pub fn from_json_lines(input: &str) -> Result<Self, serde_json::Error> {
        let events = input
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        Ok(Self { events })
    }
}

/// An event without span ids, versions or timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Access { node: NodeKey, was_hit: bool },
    Registered { node: NodeKey },
    Unregistered { node: NodeKey, pseudo: bool },
    ComputeStart { node: NodeKey },
    ComputeEnd { node: NodeKey, result: ExecutionResult },
    DependencyRegistered { parent: NodeKey, dependency: NodeKey },
    Pruned,
}

impl From<&FlowEvent> for EventKind {
    fn from(event: &FlowEvent) -> Self {
        match event {
            FlowEvent::Access { node, was_hit, .. } => EventKind::Access {
                node: node.clone(),
                was_hit: *was_hit,
            },
            FlowEvent::Registered { node, .. } => EventKind::Registered { node: node.clone() },
            FlowEvent::Unregistered { node, pseudo, .. } => EventKind::Unregistered {
                node: node.clone(),
                pseudo: *pseudo,
            },
            FlowEvent::ComputeStart { node, .. } => EventKind::ComputeStart { node: node.clone() },
            FlowEvent::ComputeEnd { node, result, .. } => EventKind::ComputeEnd {
                node: node.clone(),
                result: result.clone(),
            },
            FlowEvent::DependencyRegistered { parent, dependency } => {
                EventKind::DependencyRegistered {
                    parent: parent.clone(),
                    dependency: dependency.clone(),
                }
            }
            FlowEvent::Pruned { .. } => EventKind::Pruned,
        }
    }
}

/// Convert a trace to comparable event kinds.
pub fn to_kinds(trace: &ExecutionTrace) -> Vec<EventKind> {
    trace.events.iter().map(EventKind::from).collect()
}
