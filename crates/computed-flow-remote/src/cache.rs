//! Serialized snapshots of remote values, used to show a value before the
//! origin has answered.

use async_trait::async_trait;
use computed_flow::CallIdentity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A serialized value of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSnapshot {
    /// The value as JSON.
    pub value: serde_json::Value,
}

impl CachedSnapshot {
    /// Serialize `value`.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            value: serde_json::to_value(value)?,
        })
    }

    /// Deserialize the stored value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

/// Storage for snapshots, keyed by call identity.
#[async_trait]
pub trait SnapshotCache: Send + Sync + 'static {
    /// The stored snapshot of `identity`, if any.
    async fn load(&self, identity: &CallIdentity) -> Option<CachedSnapshot>;

    /// Store the latest snapshot of `identity`.
    async fn store(&self, identity: &CallIdentity, snapshot: CachedSnapshot);

    /// Forget `identity`.
    async fn remove(&self, identity: &CallIdentity);
}

/// Process-local [`SnapshotCache`].
#[derive(Default)]
pub struct InMemorySnapshotCache {
    entries: papaya::HashMap<CallIdentity, CachedSnapshot, ahash::RandomState>,
}

impl InMemorySnapshotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotCache for InMemorySnapshotCache {
    async fn load(&self, identity: &CallIdentity) -> Option<CachedSnapshot> {
        self.entries.pin().get(identity).cloned()
    }

    async fn store(&self, identity: &CallIdentity, snapshot: CachedSnapshot) {
        self.entries.pin().insert(identity.clone(), snapshot);
    }

    async fn remove(&self, identity: &CallIdentity) {
        self.entries.pin().remove(identity);
    }
}
