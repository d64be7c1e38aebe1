//! Tests for remote computed values over the loopback client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use computed_flow::{ComputeError, ComputedFn, ComputedNode, ComputedRuntime, Invalidation};
use computed_flow_remote::{
    CachedSnapshot, CallHandle, CallStartError, FixedDelays, InMemorySnapshotCache, LoopbackClient,
    OutboundCall, RemoteClient, RemoteComputedFn, RemoteFnOptions, RerouteError, SharedCall,
    SnapshotCache,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Origin
// =============================================================================

struct Origin {
    values: Arc<Mutex<HashMap<String, i64>>>,
    get: ComputedFn<String, i64>,
    calls: Arc<AtomicUsize>,
}

impl Origin {
    fn new(runtime: &ComputedRuntime) -> Self {
        let values = Arc::new(Mutex::new(HashMap::<String, i64>::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let store = values.clone();
        let counter = calls.clone();
        let get = runtime.function("origin.get", move |_ctx, key: String| {
            let store = store.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ComputeError>(store.lock().get(&key).copied().unwrap_or(0))
            }
        });
        Self { values, get, calls }
    }

    async fn set(&self, key: &str, value: i64) {
        self.values.lock().insert(key.to_string(), value);
        let _ = Invalidation::scope(self.get.computed(key.to_string())).await;
    }
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Loopback
// =============================================================================

#[tokio::test]
async fn test_remote_value_follows_origin() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    let client = LoopbackClient::new(origin.get.clone());
    let remote = RemoteComputedFn::new(&runtime, "remote.get", client.clone());

    origin.set("a", 1).await;
    let node = remote.computed("a".to_string()).await.unwrap();
    assert_eq!(node.value().unwrap(), 1);
    assert!(node.is_synchronized());
    assert_eq!(remote.get("a".to_string()).await.unwrap(), 1);
    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);

    origin.set("a", 2).await;
    tokio::time::timeout(Duration::from_secs(1), node.when_invalidated())
        .await
        .expect("invalidation forwarded from origin");
    assert!(node.is_invalidated());

    let fresh = node.update().await.unwrap();
    assert_eq!(fresh.value().unwrap(), 2);
    assert!(fresh.version().is_newer_than(node.version()));
}

#[tokio::test]
async fn test_local_dependents_of_remote_values() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    let remote = RemoteComputedFn::new(&runtime, "remote.get", LoopbackClient::new(origin.get.clone()));
    let doubled = {
        let remote = remote.clone();
        runtime.function("doubled", move |ctx, key: String| {
            let remote = remote.clone();
            async move { Ok::<_, ComputeError>(ctx.get(&remote, key).await? * 2) }
        })
    };

    origin.set("a", 5).await;
    let node = doubled.computed("a".to_string()).await.unwrap();
    assert_eq!(node.value().unwrap(), 10);

    origin.set("a", 6).await;
    tokio::time::timeout(Duration::from_secs(1), node.when_invalidated())
        .await
        .expect("invalidation reaches local dependents");
    assert_eq!(doubled.get("a".to_string()).await.unwrap(), 12);
}

#[tokio::test]
async fn test_invalidation_mode_invalidates_remote_node() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    let remote = RemoteComputedFn::new(&runtime, "remote.get", LoopbackClient::new(origin.get.clone()));

    let node = remote.computed("a".to_string()).await.unwrap();
    let result = Invalidation::scope(remote.computed("a".to_string())).await;
    assert!(matches!(result, Err(ComputeError::Invalidating)));
    assert!(node.is_invalidated());
    assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disposing_call_releases_origin_subscription() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    let client = LoopbackClient::new(origin.get.clone());

    let call = client.start_call("a".to_string()).await.unwrap();
    call.completed().wait().await;
    settle().await;
    assert_eq!(client.active_calls(), 1);

    call.dispose();
    settle().await;
    assert_eq!(client.active_calls(), 0);
}

// =============================================================================
// Snapshot cache
// =============================================================================

fn cached_remote(
    runtime: &ComputedRuntime,
    origin: &Origin,
    cache: &Arc<InMemorySnapshotCache>,
) -> RemoteComputedFn<String, i64> {
    let cache: Arc<dyn SnapshotCache> = cache.clone();
    RemoteComputedFn::builder(runtime, "remote.cached", LoopbackClient::new(origin.get.clone()))
        .cache(cache)
        .build()
}

#[tokio::test]
async fn test_cached_value_confirmed_by_origin() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    origin.set("a", 7).await;
    let cache = Arc::new(InMemorySnapshotCache::new());
    let remote = cached_remote(&runtime, &origin, &cache);
    cache
        .store(&remote.identity("a".to_string()), CachedSnapshot::encode(&7i64).unwrap())
        .await;

    let node = remote.computed("a".to_string()).await.unwrap();
    assert_eq!(node.value().unwrap(), 7);
    tokio::time::timeout(Duration::from_secs(1), node.when_synchronized())
        .await
        .expect("origin answered");
    assert!(node.is_consistent());
    assert!(node.is_bound());
}

#[tokio::test]
async fn test_stale_cached_value_is_invalidated() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    origin.set("a", 8).await;
    let cache = Arc::new(InMemorySnapshotCache::new());
    let remote = cached_remote(&runtime, &origin, &cache);
    let identity = remote.identity("a".to_string());
    cache.store(&identity, CachedSnapshot::encode(&1i64).unwrap()).await;

    let node = remote.computed("a".to_string()).await.unwrap();
    assert_eq!(node.value().unwrap(), 1);

    let synced = remote.synchronized("a".to_string()).await.unwrap();
    assert!(node.is_invalidated());
    assert_eq!(synced.value().unwrap(), 8);
    settle().await;
    assert_eq!(cache.load(&identity).await.unwrap().decode::<i64>().unwrap(), 8);
}

#[tokio::test]
async fn test_call_result_is_cached() {
    let runtime = ComputedRuntime::new();
    let origin = Origin::new(&runtime);
    origin.set("b", 3).await;
    let cache = Arc::new(InMemorySnapshotCache::new());
    let remote = cached_remote(&runtime, &origin, &cache);

    assert_eq!(remote.get("b".to_string()).await.unwrap(), 3);
    let identity = remote.identity("b".to_string());
    assert_eq!(cache.load(&identity).await.unwrap().decode::<i64>().unwrap(), 3);
}

// =============================================================================
// Reroute
// =============================================================================

struct FlakyClient {
    reroutes: AtomicU32,
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl RemoteClient<u32, u32> for FlakyClient {
    async fn start_call(&self, key: u32) -> Result<SharedCall<u32>, CallStartError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.reroutes.load(Ordering::SeqCst) {
            return Err(RerouteError::new(format!("shard moved ({attempt})")).into());
        }
        let call = Arc::new(CallHandle::<u32>::new());
        call.complete(Ok(key + 1));
        Ok(call)
    }
}

#[tokio::test(start_paused = true)]
async fn test_reroute_retries_until_delivered() {
    let runtime = ComputedRuntime::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let client = FlakyClient {
        reroutes: AtomicU32::new(2),
        attempts: attempts.clone(),
    };
    let remote = RemoteComputedFn::builder(&runtime, "flaky", client)
        .options(RemoteFnOptions::default().reroute_delays(FixedDelays::new([Duration::from_secs(1)])))
        .build();

    let start = tokio::time::Instant::now();
    assert_eq!(remote.get(1).await.unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_reroute_limit_becomes_node_error() {
    let runtime = ComputedRuntime::new();
    let attempts = Arc::new(AtomicU32::new(0));
    let client = FlakyClient {
        reroutes: AtomicU32::new(u32::MAX),
        attempts: attempts.clone(),
    };
    let delays = FixedDelays::new([Duration::from_millis(10)]).max_retries(3);
    let remote = RemoteComputedFn::builder(&runtime, "flaky", client)
        .options(RemoteFnOptions::default().reroute_delays(delays))
        .build();

    let node = remote.computed(1).await.unwrap();
    let err = node.value().unwrap_err();
    assert!(err.is::<RerouteError>());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    // The failure is cached like any other error.
    assert!(remote.get(1).await.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let node: Arc<dyn ComputedNode> = node;
    assert!(node.is_consistent());
}

// =============================================================================
// Cancellation
// =============================================================================

/// Hands out calls that complete only when the test says so.
#[derive(Default)]
struct PendingClient {
    calls: Arc<Mutex<Vec<Arc<CallHandle<u32>>>>>,
}

#[async_trait]
impl RemoteClient<u32, u32> for PendingClient {
    async fn start_call(&self, _key: u32) -> Result<SharedCall<u32>, CallStartError> {
        let call = Arc::new(CallHandle::<u32>::new());
        self.calls.lock().push(call.clone());
        Ok(call)
    }
}

#[tokio::test]
async fn test_cancelled_remote_read_leaves_call_running() {
    let runtime = ComputedRuntime::new();
    let client = PendingClient::default();
    let calls = client.calls.clone();
    let remote = RemoteComputedFn::new(&runtime, "pending", client);

    let cancel = CancellationToken::new();
    let read = {
        let remote = remote.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { remote.computed_cancellable(1, &cancel).await })
    };
    settle().await;
    assert_eq!(calls.lock().len(), 1);

    cancel.cancel();
    let result = read.await.unwrap();
    assert!(matches!(result, Err(ComputeError::Cancelled)));

    let call = calls.lock()[0].clone();
    assert!(!call.is_disposed());
    call.complete(Ok(5));
    assert_eq!(remote.get(1).await.unwrap(), 5);
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test]
async fn test_cancelled_synchronized_read() {
    let runtime = ComputedRuntime::new();
    let client = PendingClient::default();
    let calls = client.calls.clone();
    let remote = RemoteComputedFn::new(&runtime, "pending", client);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = remote.synchronized_cancellable(2, &cancel).await;
    assert!(matches!(result, Err(ComputeError::Cancelled)));

    let live = CancellationToken::new();
    let read = {
        let remote = remote.clone();
        tokio::spawn(async move { remote.synchronized_cancellable(2, &live).await })
    };
    settle().await;
    calls.lock()[0].complete(Ok(9));
    let node = read.await.unwrap().unwrap();
    assert_eq!(node.value().unwrap(), 9);
}
