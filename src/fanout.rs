//! Invalidation fan-out: delivers invalidation to recorded dependents.
//!
//! Invalidating a node completes its own signal synchronously and hands the
//! list of dependents to an [`InvalidationQueue`]. A single worker task
//! drains the queue. When the queue is full the batch is delivered from a
//! spawned task instead, and without a tokio runtime it is delivered inline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::ComputedNode;

type Batch = Vec<Weak<dyn ComputedNode>>;

/// Counters of the fan-out queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InvalidationStats {
    /// Dependents handed to the queue.
    pub dispatched: u64,
    /// Dependents that were still alive and got `invalidate()` called.
    pub delivered: u64,
    /// Dependents that had already been dropped.
    pub skipped_dead: u64,
    /// Dependents whose `invalidate()` panicked.
    pub failed: u64,
    /// Batches that did not fit in the queue.
    pub overflowed: u64,
}

#[derive(Default)]
struct QueueShared {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    skipped_dead: AtomicU64,
    failed: AtomicU64,
    overflowed: AtomicU64,
    pending: AtomicU64,
    idle: Notify,
}

impl QueueShared {
    fn deliver(&self, batch: Batch) {
        for dependent in batch {
            let Some(node) = dependent.upgrade() else {
                self.skipped_dead.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| node.invalidate())) {
                Ok(_) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(node = ?node.identity(), "invalidating dependent panicked");
                }
            }
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct QueueInner {
    capacity: usize,
    sender: OnceLock<mpsc::Sender<Batch>>,
    shared: Arc<QueueShared>,
}

/// Bounded queue delivering invalidation to dependents.
///
/// Cheap to clone. The worker task is started on first use inside a tokio
/// runtime and stops once every clone is dropped.
#[derive(Clone)]
pub struct InvalidationQueue {
    inner: Arc<QueueInner>,
}

impl InvalidationQueue {
    /// Create a queue holding at most `capacity` pending batches.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                capacity: capacity.max(1),
                sender: OnceLock::new(),
                shared: Arc::new(QueueShared::default()),
            }),
        }
    }

    /// Queue invalidation of `dependents`.
    pub fn dispatch(&self, dependents: Vec<Weak<dyn ComputedNode>>) {
        if dependents.is_empty() {
            return;
        }
        let shared = &self.inner.shared;
        shared
            .dispatched
            .fetch_add(dependents.len() as u64, Ordering::Relaxed);
        shared.pending.fetch_add(1, Ordering::AcqRel);
        trace!(count = dependents.len(), "dispatching invalidation");

        let Some(sender) = self.sender() else {
            shared.deliver(dependents);
            return;
        };
        match sender.try_send(dependents) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                shared.overflowed.fetch_add(1, Ordering::Relaxed);
                match Handle::try_current() {
                    Ok(handle) => {
                        let shared = shared.clone();
                        handle.spawn(async move { shared.deliver(batch) });
                    }
                    Err(_) => shared.deliver(batch),
                }
            }
            Err(TrySendError::Closed(batch)) => shared.deliver(batch),
        }
    }

    /// Snapshot of the queue counters.
    pub fn stats(&self) -> InvalidationStats {
        let shared = &self.inner.shared;
        InvalidationStats {
            dispatched: shared.dispatched.load(Ordering::Relaxed),
            delivered: shared.delivered.load(Ordering::Relaxed),
            skipped_dead: shared.skipped_dead.load(Ordering::Relaxed),
            failed: shared.failed.load(Ordering::Relaxed),
            overflowed: shared.overflowed.load(Ordering::Relaxed),
        }
    }

    /// Number of batches dispatched but not yet delivered.
    pub fn pending(&self) -> u64 {
        self.inner.shared.pending.load(Ordering::Acquire)
    }

    /// Wait until every dispatched batch has been delivered.
    ///
    /// Batches dispatched by the delivery itself (deeper dependents) are
    /// awaited too.
    pub async fn settled(&self) {
        let shared = &self.inner.shared;
        loop {
            let notified = shared.idle.notified();
            if shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn sender(&self) -> Option<&mpsc::Sender<Batch>> {
        if let Some(sender) = self.inner.sender.get() {
            return Some(sender);
        }
        let handle = Handle::try_current().ok()?;
        Some(self.inner.sender.get_or_init(|| {
            let (sender, receiver) = mpsc::channel(self.inner.capacity);
            handle.spawn(run_worker(self.inner.shared.clone(), receiver));
            sender
        }))
    }
}

async fn run_worker(shared: Arc<QueueShared>, mut receiver: mpsc::Receiver<Batch>) {
    while let Some(batch) = receiver.recv().await {
        shared.deliver(batch);
    }
}
