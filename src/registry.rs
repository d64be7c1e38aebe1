//! Process-wide map from call identity to the current node.

use std::sync::Arc;

use papaya::{Compute, Operation};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{CallIdentity, ComputedNode, EventSampler, NodeInfo, Tracer};

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PruneReport {
    /// Entries examined.
    pub scanned: usize,
    /// Invalidated entries removed.
    pub removed_invalidated: usize,
    /// Consistent entries removed because nothing referenced them.
    pub removed_unreferenced: usize,
    /// Dead dependent references dropped from the remaining entries.
    pub compacted_dependents: usize,
}

fn same_node(a: &Arc<dyn ComputedNode>, b: &Arc<dyn ComputedNode>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Concurrent registry of computed nodes keyed by [`CallIdentity`].
///
/// Reads and writes never take a global lock. Races between nodes of the
/// same call are settled per entry by pointer comparison.
pub struct ComputedRegistry {
    entries: papaya::HashMap<CallIdentity, Arc<dyn ComputedNode>, ahash::RandomState>,
    tracer: Arc<dyn Tracer>,
    access_sampler: EventSampler,
    registration_sampler: EventSampler,
}

impl ComputedRegistry {
    /// Create an empty registry reporting to `tracer`.
    ///
    /// Access events and (un)registration events are sampled independently,
    /// one in every `sample_every`.
    pub fn new(tracer: Arc<dyn Tracer>, sample_every: u64) -> Self {
        Self {
            entries: Default::default(),
            tracer,
            access_sampler: EventSampler::every_nth(sample_every),
            registration_sampler: EventSampler::every_nth(sample_every),
        }
    }

    /// Register `node` as the current node of its call.
    ///
    /// A different node previously registered for the same call is replaced
    /// and invalidated. The entry is unregistered automatically once `node`
    /// gets invalidated.
    pub fn register(self: &Arc<Self>, node: Arc<dyn ComputedNode>) {
        let identity = node.identity().clone();
        let displaced = {
            let entries = self.entries.pin();
            let result = entries.compute(identity, |existing| match existing {
                Some((_, current)) if same_node(current, &node) => Operation::Abort(()),
                _ => Operation::Insert(node.clone()),
            });
            match result {
                Compute::Inserted(_, _) => None,
                Compute::Updated { old: (_, old), .. } => Some(old.clone()),
                Compute::Removed(_, _) => unreachable!("register never removes"),
                Compute::Aborted(()) => return,
            }
        };

        trace!(node = ?node.identity(), version = node.version().0, "registered");
        if self.registration_sampler.sample() {
            self.tracer.on_register(&NodeInfo::of(node.as_ref()));
        }

        if let Some(old) = displaced {
            old.invalidate();
        }

        let registry = Arc::downgrade(self);
        let weak_node = Arc::downgrade(&node);
        let subscription = node.invalidated_signal().subscribe(move || {
            if let (Some(registry), Some(node)) = (registry.upgrade(), weak_node.upgrade()) {
                registry.on_node_invalidated(&node);
            }
        });
        match subscription {
            Some(subscription) => subscription.detach(),
            None => self.on_node_invalidated(&node),
        }
    }

    fn on_node_invalidated(&self, node: &Arc<dyn ComputedNode>) {
        if node.is_synchronizing() {
            self.pseudo_unregister(node);
        } else {
            self.unregister(node);
        }
    }

    /// The current node for `identity`, unless absent or invalidated.
    pub fn try_get(&self, identity: &CallIdentity) -> Option<Arc<dyn ComputedNode>> {
        let node = self.entries.pin().get(identity).cloned()?;
        if node.is_invalidated() {
            return None;
        }
        Some(node)
    }

    /// The registered node for `identity` in any state.
    pub fn get(&self, identity: &CallIdentity) -> Option<Arc<dyn ComputedNode>> {
        self.entries.pin().get(identity).cloned()
    }

    /// Remove the entry for `node`'s call if it still refers to `node`.
    ///
    /// Returns true if the entry was removed.
    pub fn unregister(&self, node: &Arc<dyn ComputedNode>) -> bool {
        let removed = self.remove_exact(node);
        if removed {
            trace!(node = ?node.identity(), version = node.version().0, "unregistered");
            if self.registration_sampler.sample() {
                self.tracer.on_unregister(&NodeInfo::of(node.as_ref()), false);
            }
        }
        removed
    }

    /// Report `node` as unregistered without removing it.
    ///
    /// Used for invalidated nodes that must stay reachable until a pending
    /// acknowledgement settles.
    pub fn pseudo_unregister(&self, node: &Arc<dyn ComputedNode>) {
        trace!(node = ?node.identity(), version = node.version().0, "pseudo-unregistered");
        if self.registration_sampler.sample() {
            self.tracer.on_unregister(&NodeInfo::of(node.as_ref()), true);
        }
    }

    /// Report a read of `node` to the tracer (sampled).
    pub fn record_access(&self, node: &dyn ComputedNode, was_hit: bool) {
        if self.access_sampler.sample() {
            self.tracer.on_access(&NodeInfo::of(node), was_hit);
        }
    }

    fn remove_exact(&self, node: &Arc<dyn ComputedNode>) -> bool {
        matches!(
            self.entries
                .pin()
                .remove_if(node.identity(), |_, current| same_node(current, node)),
            Ok(Some(_))
        )
    }

    /// Number of entries, including invalidated ones not yet removed.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Returns true if the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of all entries.
    pub fn identities(&self) -> Vec<CallIdentity> {
        self.entries.pin().keys().cloned().collect()
    }

    /// Remove entries nobody needs anymore.
    ///
    /// Drops invalidated entries that are not waiting for an acknowledgement,
    /// and consistent entries that have no holder besides the registry, no
    /// live dependents, and were not read within their minimum cache
    /// duration. Removed consistent nodes are invalidated, so a reader that
    /// still holds one sees it as stale and recomputes.
    pub fn prune(&self) -> PruneReport {
        let now = Instant::now();
        let candidates: Vec<Arc<dyn ComputedNode>> = self.entries.pin().values().cloned().collect();
        let mut report = PruneReport::default();

        for node in candidates {
            report.scanned += 1;
            report.compacted_dependents += node.compact_dependents();

            if node.is_invalidated() {
                if !node.is_synchronizing() && self.remove_exact(&node) {
                    report.removed_invalidated += 1;
                }
                continue;
            }

            // One reference held by the map, one by `candidates`.
            let unreferenced = Arc::strong_count(&node) <= 2 && node.live_dependent_count() == 0;
            let expired = now.duration_since(node.last_access()) >= node.min_cache_duration();
            if unreferenced && expired && self.remove_exact(&node) {
                // A reader may have cloned the node after the count check.
                // It must not keep using a node the registry no longer tracks.
                node.invalidate();
                report.removed_unreferenced += 1;
            }
        }

        debug!(
            scanned = report.scanned,
            removed_invalidated = report.removed_invalidated,
            removed_unreferenced = report.removed_unreferenced,
            compacted = report.compacted_dependents,
            "pruned registry"
        );
        self.tracer.on_pruned(&report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::node;
    use crate::{InvalidationQueue, NoopTracer};

    fn registry() -> Arc<ComputedRegistry> {
        Arc::new(ComputedRegistry::new(Arc::new(NoopTracer), 1))
    }

    #[test]
    fn test_register_and_unregister_on_invalidation() {
        let registry = registry();
        let queue = InvalidationQueue::new(8);
        let n = node::<i32>("n", &queue);
        n.try_set_output(Ok(1));
        let dyn_node: Arc<dyn ComputedNode> = n.clone();

        registry.register(dyn_node.clone());
        assert!(registry.try_get(dyn_node.identity()).is_some());

        n.invalidate();
        assert!(registry.try_get(dyn_node.identity()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registering_twice_is_noop() {
        let registry = registry();
        let queue = InvalidationQueue::new(8);
        let n = node::<i32>("n", &queue);
        n.try_set_output(Ok(1));
        registry.register(n.clone());
        registry.register(n.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(n.invalidated_signal().subscriber_count(), 1);
    }

    #[test]
    fn test_unregister_is_compare_and_remove() {
        let registry = registry();
        let queue = InvalidationQueue::new(8);
        let old = node::<i32>("n", &queue);
        // Same identity, different node.
        let identity = old.input().identity().clone();
        let new: Arc<crate::Computed<i32>> = Arc::new(crate::Computed::new(
            Arc::new(crate::node::tests::FixedInput(identity.clone())),
            crate::Version(2),
            &crate::ComputedOptions::default(),
            queue.clone(),
        ));
        old.try_set_output(Ok(1));
        new.try_set_output(Ok(2));

        registry.register(old.clone());
        registry.register(new.clone());
        // The displaced node is invalidated and its unregister does not
        // remove the replacement.
        assert!(old.is_invalidated());
        let current = registry.try_get(&identity).unwrap();
        assert_eq!(current.version(), crate::Version(2));

        let old_dyn: Arc<dyn ComputedNode> = old;
        assert!(!registry.unregister(&old_dyn));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registering_invalidated_node_unregisters_it() {
        let registry = registry();
        let queue = InvalidationQueue::new(8);
        let n = node::<i32>("n", &queue);
        n.invalidate();
        registry.register(n.clone());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prune_removes_unreferenced_entries() {
        let registry = registry();
        let queue = InvalidationQueue::new(8);
        let held = node::<i32>("held", &queue);
        held.try_set_output(Ok(1));
        registry.register(held.clone());
        {
            let dropped = node::<i32>("dropped", &queue);
            dropped.try_set_output(Ok(2));
            registry.register(dropped);
        }

        let report = registry.prune();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed_unreferenced, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.try_get(held.input().identity()).is_some());
    }

    #[test]
    fn test_prune_invalidates_removed_entries() {
        let registry = registry();
        let queue = InvalidationQueue::new(8);
        let signal = {
            let dropped = node::<i32>("dropped", &queue);
            dropped.try_set_output(Ok(2));
            registry.register(dropped.clone());
            dropped.invalidated_signal().clone()
        };
        assert!(!signal.is_set());

        let report = registry.prune();
        assert_eq!(report.removed_unreferenced, 1);
        assert!(registry.is_empty());
        assert!(signal.is_set());
    }
}
