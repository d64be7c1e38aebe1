//! Remote computed values for `computed-flow`.
//!
//! A [`RemoteComputedFn`] reads values computed by another host through a
//! [`RemoteClient`]. Each read returns a [`RemoteComputed`]: a node of the
//! local dependency graph whose invalidation follows the origin's. With a
//! [`SnapshotCache`] the last known value is served immediately and checked
//! against the origin in the background.
//!
//! The [`Reconnector`] keeps the connection such a client needs alive,
//! backing off between attempts according to a [`RetryDelays`] sequence.
//!
//! # Example
//!
//! ```
//! use computed_flow::{ComputeError, ComputedRuntime};
//! use computed_flow_remote::{LoopbackClient, RemoteComputedFn};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let runtime = ComputedRuntime::new();
//! let server = runtime.function("server.square", |_ctx, n: u64| async move {
//!     Ok::<_, ComputeError>(n * n)
//! });
//! let client = RemoteComputedFn::new(&runtime, "client.square", LoopbackClient::new(server));
//!
//! let node = client.computed(4).await.unwrap();
//! assert_eq!(node.value().unwrap(), 16);
//! assert!(node.is_synchronized());
//! # });
//! ```
#![warn(missing_docs)]

mod cache;
mod call;
mod error;
mod reconnector;
mod remote;
mod retry;
mod synchronizer;

pub use cache::{CachedSnapshot, InMemorySnapshotCache, SnapshotCache};
pub use call::{CallHandle, OutboundCall, SharedCall};
pub use error::{CallStartError, ReconnectError, RerouteError};
pub use reconnector::{
    AlwaysTransient, ConnectionState, Connector, Reconnector, ReconnectorBuilder, ReconnectorOptions,
    ReconnectorStatus, Transiency, TransiencyResolver,
};
pub use remote::{RemoteComputed, RemoteInput, RemoteSeed};
pub use retry::{ExponentialDelays, FixedDelays, RetryDelay, RetryDelays};
pub use synchronizer::{
    LoopbackClient, RemoteClient, RemoteComputedFn, RemoteComputedFnBuilder, RemoteFnOptions,
};
