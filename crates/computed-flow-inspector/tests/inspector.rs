//! Event traces produced by a real runtime.

use std::sync::Arc;

use computed_flow::{ComputeError, ComputedFn, ComputedRuntime};
use computed_flow_inspector::{
    to_kinds, EventCollector, EventKind, EventSinkTracer, ExecutionResult, ExecutionTrace,
    FilterSink, FlowEvent, LogSink, MultiplexSink, NodeKey,
};

// =============================================================================
// Fixtures
// =============================================================================

struct Fixture {
    runtime: ComputedRuntime,
    collector: Arc<EventCollector>,
    base: ComputedFn<u32, u32>,
    doubled: ComputedFn<u32, u32>,
}

fn fixture_with(runtime: ComputedRuntime, collector: Arc<EventCollector>) -> Fixture {
    let base = runtime.function("base", |_ctx, n: u32| async move { Ok::<_, ComputeError>(n + 1) });
    let doubled = {
        let base = base.clone();
        runtime.function("doubled", move |ctx, n: u32| {
            let base = base.clone();
            async move { Ok::<_, ComputeError>(ctx.get(&base, n).await? * 2) }
        })
    };
    Fixture {
        runtime,
        collector,
        base,
        doubled,
    }
}

fn fixture() -> Fixture {
    let collector = Arc::new(EventCollector::new());
    let runtime = ComputedRuntime::builder()
        .tracer(EventSinkTracer::new(collector.clone()))
        .build();
    fixture_with(runtime, collector)
}

fn base(n: u32) -> NodeKey {
    NodeKey::new("base", n.to_string())
}

fn doubled(n: u32) -> NodeKey {
    NodeKey::new("doubled", n.to_string())
}

// =============================================================================
// Computation
// =============================================================================

#[tokio::test]
async fn test_cold_read_events() {
    use EventKind::*;

    let f = fixture();
    assert_eq!(f.base.get(1).await.unwrap(), 2);

    assert_eq!(
        to_kinds(&f.collector.trace()),
        vec![
            Access {
                node: base(1),
                was_hit: false
            },
            ComputeStart { node: base(1) },
            Registered { node: base(1) },
            ComputeEnd {
                node: base(1),
                result: ExecutionResult::Computed
            },
        ]
    );
}

#[tokio::test]
async fn test_cached_read_events() {
    use EventKind::*;

    let f = fixture();
    f.base.get(1).await.unwrap();
    f.collector.clear();

    assert_eq!(f.base.get(1).await.unwrap(), 2);
    assert_eq!(
        to_kinds(&f.collector.trace()),
        vec![Access {
            node: base(1),
            was_hit: true
        }]
    );
}

#[tokio::test]
async fn test_dependency_events() {
    use EventKind::*;

    let f = fixture();
    assert_eq!(f.doubled.get(2).await.unwrap(), 6);

    assert_eq!(
        to_kinds(&f.collector.trace()),
        vec![
            Access {
                node: doubled(2),
                was_hit: false
            },
            ComputeStart { node: doubled(2) },
            // base(2) = 3
            Access {
                node: base(2),
                was_hit: false
            },
            ComputeStart { node: base(2) },
            Registered { node: base(2) },
            ComputeEnd {
                node: base(2),
                result: ExecutionResult::Computed
            },
            DependencyRegistered {
                parent: doubled(2),
                dependency: base(2),
            },
            // doubled completes
            Registered { node: doubled(2) },
            ComputeEnd {
                node: doubled(2),
                result: ExecutionResult::Computed
            },
        ]
    );
}

#[tokio::test]
async fn test_error_result_is_traced() {
    let collector = Arc::new(EventCollector::new());
    let runtime = ComputedRuntime::builder()
        .tracer(EventSinkTracer::new(collector.clone()))
        .build();
    let failing = runtime.function("failing", |_ctx, n: u32| async move {
        if n == 0 {
            return Err(ComputeError::from(std::io::Error::other("division by zero")));
        }
        Ok(100 / n)
    });

    assert!(failing.get(0).await.is_err());
    let trace = collector.trace();
    assert!(trace.has_event(|e| matches!(
        e,
        FlowEvent::ComputeEnd { result: ExecutionResult::Error { message }, .. }
            if message.contains("division by zero")
    )));
    // Errors are registered like values.
    assert!(trace.has_event(|e| matches!(e, FlowEvent::Registered { .. })));
}

// =============================================================================
// Invalidation and pruning
// =============================================================================

#[tokio::test]
async fn test_invalidation_unregisters_dependents() {
    let f = fixture();
    let node = f.doubled.computed(4).await.unwrap();
    f.collector.clear();

    assert!(f.base.invalidate(4));
    node.when_invalidated().await;
    f.runtime.invalidations_settled().await;

    let trace = f.collector.trace();
    let unregistered: Vec<&NodeKey> = trace
        .events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::Unregistered {
                node,
                pseudo: false,
                ..
            } => Some(node),
            _ => None,
        })
        .collect();
    assert!(unregistered.contains(&&base(4)));
    assert!(unregistered.contains(&&doubled(4)));

    f.collector.clear();
    assert_eq!(f.doubled.get(4).await.unwrap(), 10);
    assert_eq!(
        f.collector.trace().computed_nodes(),
        vec![&doubled(4), &base(4)]
    );
}

#[tokio::test]
async fn test_prune_is_traced() {
    let f = fixture();
    f.doubled.get(1).await.unwrap();
    f.base.invalidate(1);
    f.runtime.invalidations_settled().await;

    let report = f.runtime.prune();
    let pruned = f
        .collector
        .events()
        .into_iter()
        .filter_map(|e| match e {
            FlowEvent::Pruned { report } => Some(report),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(pruned, vec![report]);
}

// =============================================================================
// Sinks
// =============================================================================

#[tokio::test]
async fn test_sampling_drops_access_events_only() {
    let collector = Arc::new(EventCollector::new());
    let runtime = ComputedRuntime::builder()
        .tracer(EventSinkTracer::new(collector.clone()))
        .event_sampler(0)
        .build();
    let f = fixture_with(runtime, collector);

    f.doubled.get(1).await.unwrap();
    f.doubled.get(1).await.unwrap();

    let trace = f.collector.trace();
    assert_eq!(trace.hits() + trace.misses(), 0);
    assert_eq!(trace.computed_nodes(), vec![&doubled(1), &base(1)]);
}

#[tokio::test]
async fn test_multiplexed_sinks() {
    let all = Arc::new(EventCollector::new());
    let computations = Arc::new(EventCollector::new());
    let sink = MultiplexSink::new(vec![
        Box::new(all.clone()),
        Box::new(FilterSink::new(
            |e| matches!(e, FlowEvent::ComputeEnd { .. }),
            computations.clone(),
        )),
        Box::new(LogSink::default()),
    ]);
    let runtime = ComputedRuntime::builder()
        .tracer(EventSinkTracer::new(Arc::new(sink)))
        .build();
    let f = fixture_with(runtime, all.clone());

    f.doubled.get(3).await.unwrap();

    assert_eq!(computations.len(), 2);
    assert!(all.len() > computations.len());
}

#[tokio::test]
async fn test_trace_survives_json_lines() {
    let f = fixture();
    f.doubled.get(5).await.unwrap();
    f.doubled.get(5).await.unwrap();

    let trace = f.collector.trace();
    let text = trace.to_json_lines().unwrap();
    let parsed = ExecutionTrace::from_json_lines(&text).unwrap();
    assert_eq!(to_kinds(&parsed), to_kinds(&trace));
    assert_eq!(parsed.hits(), 1);
}
