use std::sync::atomic::{AtomicU64, Ordering};

/// Version is a logical tag assigned to a computed node when it is created.
///
/// Versions come from a [`VersionClock`] and only increase, so a node with a
/// greater version supersedes a node of the same call with a smaller one.
/// They are not wall-clock times.
///
/// # Examples
///
/// ```
/// # use computed_flow::{LogicalClock, VersionClock};
/// let clock = LogicalClock::new();
/// let a = clock.next();
/// let b = clock.next();
/// assert!(b.is_newer_than(a));
/// assert!(!a.is_newer_than(b));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Version(pub u64);

impl Version {
    /// Returns true if this version supersedes `other`.
    pub fn is_newer_than(&self, other: Version) -> bool {
        self.0 > other.0
    }
}

/// A source of version tags.
pub trait VersionClock: Send + Sync + 'static {
    /// Allocate the next version.
    fn next(&self) -> Version;
}

/// Default clock: an atomic counter starting at 1.
#[derive(Debug)]
pub struct LogicalClock {
    next: AtomicU64,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalClock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl VersionClock for LogicalClock {
    fn next(&self) -> Version {
        Version(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
