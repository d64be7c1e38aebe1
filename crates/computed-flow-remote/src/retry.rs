//! Retry delay sequences shared by the reroute loop and the reconnector.

use std::time::Duration;

use rand::Rng;

/// What to do before retry number `try_index + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Wait this long, then retry.
    After(Duration),
    /// Stop retrying.
    LimitExceeded,
}

/// A sequence of retry delays indexed by the number of consecutive failures.
///
/// There is no built-in cap on retries: a sequence that never returns
/// [`RetryDelay::LimitExceeded`] retries forever.
pub trait RetryDelays: Send + Sync + 'static {
    /// Delay after the failure of attempt `try_index` (0-based).
    fn delay(&self, try_index: u32) -> RetryDelay;
}

/// Explicit list of delays. The last delay repeats once the list is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDelays {
    delays: Vec<Duration>,
    max_retries: Option<u32>,
}

impl FixedDelays {
    /// Use `delays` in order, repeating the last one.
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: delays.into_iter().collect(),
            max_retries: None,
        }
    }

    /// Give up after `max_retries` retries.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl RetryDelays for FixedDelays {
    fn delay(&self, try_index: u32) -> RetryDelay {
        if self.max_retries.is_some_and(|max| try_index >= max) {
            return RetryDelay::LimitExceeded;
        }
        let index = (try_index as usize).min(self.delays.len().saturating_sub(1));
        RetryDelay::After(self.delays.get(index).copied().unwrap_or_default())
    }
}

/// Exponentially growing delays with random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialDelays {
    /// Delay after the first failure.
    pub min: Duration,
    /// Upper bound of the delay before jitter.
    pub max: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`; the delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// Give up after this many retries.
    pub max_retries: Option<u32>,
}

impl Default for ExponentialDelays {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_retries: None,
        }
    }
}

impl ExponentialDelays {
    fn base_delay(&self, try_index: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(try_index.min(64) as i32);
        let secs = (self.min.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }
}

impl RetryDelays for ExponentialDelays {
    fn delay(&self, try_index: u32) -> RetryDelay {
        if self.max_retries.is_some_and(|max| try_index >= max) {
            return RetryDelay::LimitExceeded;
        }
        let base = self.base_delay(try_index);
        // NaN jitter counts as none.
        if !(self.jitter > 0.0) {
            return RetryDelay::After(base);
        }
        let jitter = self.jitter.min(1.0);
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        let jittered = Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(Duration::MAX);
        RetryDelay::After(jittered)
    }
}
