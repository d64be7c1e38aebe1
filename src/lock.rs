//! Keyed async lock with refcounted entries and flow-aware reentry checks.

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors returned by [`AsyncLockSet`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    /// The key is already held by the current flow and the set runs in
    /// [`ReentryMode::CheckedFail`].
    #[error("lock for {key} is already held by the current flow")]
    AlreadyLocked {
        /// Debug representation of the key.
        key: String,
    },
    /// The entry was torn down while it was being acquired.
    #[error("lock entry already disposed")]
    Disposed,
    /// The acquisition was cancelled before the lock was granted.
    #[error("lock acquisition cancelled")]
    Cancelled,
}

/// How a nested acquisition of a key already held by the same flow behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReentryMode {
    /// Nested acquisition fails with [`LockError::AlreadyLocked`].
    #[default]
    CheckedFail,
    /// Nested acquisition succeeds without acquiring again; logged at debug level.
    CheckedPass,
    /// Nested acquisition succeeds silently without acquiring again.
    Unchecked,
}

tokio::task_local! {
    static LOCK_FLOW: Arc<LockFlow>;
}

/// One link of the chain of keys held by the current flow.
///
/// Siblings that run concurrently in the same task each extend the chain of
/// their common parent, so a sibling holding a key does not look like reentry.
struct LockFlow {
    set_id: u64,
    key: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<LockFlow>>,
}

impl LockFlow {
    fn current() -> Option<Arc<LockFlow>> {
        LOCK_FLOW.try_with(Arc::clone).ok()
    }

    fn holds<K: Eq + 'static>(flow: &Option<Arc<LockFlow>>, set_id: u64, key: &K) -> bool {
        let mut cursor = flow.as_ref();
        while let Some(link) = cursor {
            if link.set_id == set_id && link.key.downcast_ref::<K>() == Some(key) {
                return true;
            }
            cursor = link.parent.as_ref();
        }
        false
    }
}

/// The chain of keys held by the current task, captured so that a spawned
/// task can continue the same flow.
#[derive(Clone, Default)]
pub struct LockFlowSnapshot(Option<Arc<LockFlow>>);

impl LockFlowSnapshot {
    /// Capture the flow of the current task.
    pub fn capture() -> Self {
        Self(LockFlow::current())
    }

    /// Run `fut` as part of the captured flow.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        match &self.0 {
            Some(flow) => LOCK_FLOW.scope(flow.clone(), fut).await,
            None => fut.await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Open(usize),
    Closing,
    Closed,
}

struct LockEntry {
    state: Mutex<EntryState>,
    semaphore: Arc<Semaphore>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::Open(0)),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    fn try_use(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            EntryState::Open(count) => {
                *state = EntryState::Open(count + 1);
                true
            }
            EntryState::Closing | EntryState::Closed => false,
        }
    }

    /// Returns true if this was the last use and the entry is now closing.
    fn end_use(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            EntryState::Open(count) if count > 1 => {
                *state = EntryState::Open(count - 1);
                false
            }
            EntryState::Open(_) => {
                *state = EntryState::Closing;
                true
            }
            EntryState::Closing | EntryState::Closed => false,
        }
    }

    fn close(&self) {
        *self.state.lock() = EntryState::Closed;
        self.semaphore.close();
    }
}

static NEXT_LOCK_SET_ID: AtomicU64 = AtomicU64::new(1);

struct LockSetInner<K> {
    id: u64,
    entries: papaya::HashMap<K, Arc<LockEntry>, ahash::RandomState>,
    reentry_mode: ReentryMode,
}

/// A set of async mutexes, one per key, created on demand.
///
/// Entries are refcounted by the holder plus every waiter and are removed
/// from the set as soon as the count drops back to zero.
pub struct AsyncLockSet<K> {
    inner: Arc<LockSetInner<K>>,
}

impl<K> Clone for AsyncLockSet<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> AsyncLockSet<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create an empty lock set.
    pub fn new(reentry_mode: ReentryMode) -> Self {
        Self {
            inner: Arc::new(LockSetInner {
                id: NEXT_LOCK_SET_ID.fetch_add(1, Ordering::Relaxed),
                entries: Default::default(),
                reentry_mode,
            }),
        }
    }

    /// The reentry mode this set was created with.
    pub fn reentry_mode(&self) -> ReentryMode {
        self.inner.reentry_mode
    }

    /// Number of live entries (held or awaited keys).
    pub fn len(&self) -> usize {
        self.inner.entries.pin().len()
    }

    /// Returns true if no key is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the lock for `key`.
    pub async fn lock(&self, key: K) -> Result<LockReleaser<K>, LockError> {
        let parent = LockFlow::current();
        if LockFlow::holds(&parent, self.inner.id, &key) {
            return match self.inner.reentry_mode {
                ReentryMode::CheckedFail => Err(LockError::AlreadyLocked {
                    key: format!("{key:?}"),
                }),
                ReentryMode::CheckedPass => {
                    debug!(key = ?key, "lock re-entered by the same flow");
                    Ok(LockReleaser::reentrant(parent))
                }
                ReentryMode::Unchecked => Ok(LockReleaser::reentrant(parent)),
            };
        }

        let entry_use = self.enter(&key).await;
        let permit = entry_use
            .entry
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LockError::Disposed)?;

        let flow = Arc::new(LockFlow {
            set_id: self.inner.id,
            key: Arc::new(key),
            parent,
        });
        Ok(LockReleaser {
            held: Some(Held {
                _permit: permit,
                _entry_use: entry_use,
            }),
            flow: Some(flow),
        })
    }

    /// Acquire the lock for `key`, giving up when `cancel` fires.
    ///
    /// A cancelled acquisition leaves the entry exactly as it found it.
    pub async fn lock_cancellable(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<LockReleaser<K>, LockError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            result = self.lock(key) => result,
        }
    }

    async fn enter(&self, key: &K) -> EntryUse<K> {
        loop {
            let entry = {
                let entries = self.inner.entries.pin();
                entries
                    .get_or_insert_with(key.clone(), || Arc::new(LockEntry::new()))
                    .clone()
            };
            if entry.try_use() {
                return EntryUse {
                    set: self.inner.clone(),
                    key: key.clone(),
                    entry,
                };
            }
            // The entry is closing; wait for the last holder to remove it.
            tokio::task::yield_now().await;
        }
    }
}

struct EntryUse<K: Eq + Hash> {
    set: Arc<LockSetInner<K>>,
    key: K,
    entry: Arc<LockEntry>,
}

impl<K: Eq + Hash> Drop for EntryUse<K> {
    fn drop(&mut self) {
        if !self.entry.end_use() {
            return;
        }
        let _ = self
            .set
            .entries
            .pin()
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.entry));
        self.entry.close();
    }
}

struct Held<K: Eq + Hash> {
    // Dropped before the use count is released.
    _permit: OwnedSemaphorePermit,
    _entry_use: EntryUse<K>,
}

/// Guard returned by [`AsyncLockSet::lock`]; the lock is released on drop.
#[must_use = "the lock is released as soon as the releaser is dropped"]
pub struct LockReleaser<K: Eq + Hash> {
    held: Option<Held<K>>,
    flow: Option<Arc<LockFlow>>,
}

impl<K: Eq + Hash> LockReleaser<K> {
    fn reentrant(flow: Option<Arc<LockFlow>>) -> Self {
        Self { held: None, flow }
    }

    /// Returns true if this releaser did not acquire anything because the
    /// flow already held the key.
    pub fn is_reentrant(&self) -> bool {
        self.held.is_none()
    }

    /// Run `fut` as part of the flow that holds this lock.
    ///
    /// Locks taken inside `fut` on a key this flow already holds are treated
    /// as reentry according to the set's [`ReentryMode`].
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        match &self.flow {
            Some(flow) => LOCK_FLOW.scope(flow.clone(), fut).await,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entries_are_removed_after_release() {
        let locks = AsyncLockSet::new(ReentryMode::CheckedFail);
        let releaser = locks.lock("a").await.unwrap();
        assert_eq!(locks.len(), 1);
        drop(releaser);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = AsyncLockSet::new(ReentryMode::CheckedFail);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(1u32).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_checked_fail_rejects_reentry() {
        let locks = AsyncLockSet::new(ReentryMode::CheckedFail);
        let outer = locks.lock("k").await.unwrap();
        let nested = outer.scope(locks.lock("k")).await;
        assert!(matches!(nested, Err(LockError::AlreadyLocked { .. })));

        // Other keys are unaffected.
        let other = outer.scope(locks.lock("other")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_unchecked_reentry_does_not_block() {
        let locks = AsyncLockSet::new(ReentryMode::Unchecked);
        let outer = locks.lock("k").await.unwrap();
        let nested = tokio::time::timeout(Duration::from_secs(1), outer.scope(locks.lock("k")))
            .await
            .expect("reentry must not block")
            .unwrap();
        assert!(nested.is_reentrant());
        drop(nested);
        // The outer hold survives the nested releaser.
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_checked_pass_reentry() {
        let locks = AsyncLockSet::new(ReentryMode::CheckedPass);
        let outer = locks.lock(5u8).await.unwrap();
        let nested = outer.scope(locks.lock(5u8)).await.unwrap();
        assert!(nested.is_reentrant());
    }

    #[tokio::test]
    async fn test_cancelled_acquisition_releases_entry() {
        let locks = AsyncLockSet::new(ReentryMode::CheckedFail);
        let held = locks.lock("k").await.unwrap();
        let cancel = CancellationToken::new();
        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.lock_cancellable("k", &cancel).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(LockError::Cancelled)));
        drop(held);
        assert!(locks.is_empty());
    }
}
