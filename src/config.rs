//! Runtime and per-function configuration.

use std::time::Duration;

/// Default capacity of the invalidation fan-out queue, in batches.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Per-function caching options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedOptions {
    /// Keep an unreferenced consistent node in the registry at least this
    /// long after its last access before the pruner may drop it.
    pub min_cache_duration: Duration,
    /// Invalidate a consistent value this long after it was computed.
    pub auto_invalidation_delay: Option<Duration>,
    /// Invalidate a cached error this long after it was computed, so the
    /// next read retries.
    pub error_invalidation_delay: Option<Duration>,
}

impl ComputedOptions {
    /// Set [`ComputedOptions::min_cache_duration`].
    pub fn min_cache_duration(mut self, duration: Duration) -> Self {
        self.min_cache_duration = duration;
        self
    }

    /// Set [`ComputedOptions::auto_invalidation_delay`].
    pub fn auto_invalidation_delay(mut self, delay: Duration) -> Self {
        self.auto_invalidation_delay = Some(delay);
        self
    }

    /// Set [`ComputedOptions::error_invalidation_delay`].
    pub fn error_invalidation_delay(mut self, delay: Duration) -> Self {
        self.error_invalidation_delay = Some(delay);
        self
    }
}

/// Runtime-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Interval of the background pruner. `None` disables it; call
    /// [`ComputedRuntime::prune`](crate::ComputedRuntime::prune) manually.
    pub prune_interval: Option<Duration>,
    /// Capacity of the invalidation fan-out queue, in batches.
    pub invalidation_queue_capacity: usize,
    /// Forward one in every `sample_every` access events to the tracer.
    /// `0` disables access events.
    pub sample_every: u64,
    /// Options used by functions registered without explicit options.
    pub default_options: ComputedOptions,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            prune_interval: None,
            invalidation_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sample_every: 1,
            default_options: ComputedOptions::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from environment variables.
    ///
    /// Reads:
    /// - `COMPUTED_FLOW_PRUNE_INTERVAL_MS`: pruner interval (default: disabled)
    /// - `COMPUTED_FLOW_QUEUE_CAPACITY`: fan-out queue capacity (default: 1024)
    /// - `COMPUTED_FLOW_SAMPLE_EVERY`: access event sampling (default: 1)
    /// - `COMPUTED_FLOW_MIN_CACHE_MS`: default `min_cache_duration` (default: 0)
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = Self::default();

        Self {
            prune_interval: parse("COMPUTED_FLOW_PRUNE_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            invalidation_queue_capacity: parse("COMPUTED_FLOW_QUEUE_CAPACITY")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.invalidation_queue_capacity),
            sample_every: parse("COMPUTED_FLOW_SAMPLE_EVERY").unwrap_or(defaults.sample_every),
            default_options: ComputedOptions {
                min_cache_duration: parse("COMPUTED_FLOW_MIN_CACHE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or_default(),
                ..defaults.default_options
            },
        }
    }
}
