//! Error types of the remote layer.

use std::sync::Arc;

use computed_flow::ComputeError;

/// The destination of a call changed; the call should be started again.
#[derive(Debug, Clone, thiserror::Error)]
#[error("call must be rerouted: {reason}")]
pub struct RerouteError {
    /// Why the call could not be delivered where it was sent.
    pub reason: String,
}

impl RerouteError {
    /// Create a reroute request.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure to start an outbound call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallStartError {
    /// Retry the call after a reroute delay.
    #[error(transparent)]
    Reroute(#[from] RerouteError),
    /// The call failed for good; the error becomes the node's output.
    #[error("call failed: {0}")]
    Failed(ComputeError),
}

/// Errors reported by a [`Reconnector`](crate::Reconnector).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconnectError {
    /// A failure classified as fatal stopped the reconnect loop.
    #[error("fatal connection error: {0}")]
    Fatal(Arc<anyhow::Error>),
    /// The retry delay sequence ran out of attempts.
    #[error("gave up reconnecting after {tries} failed attempts: {last_error}")]
    RetryLimitExceeded {
        /// Consecutive failed attempts.
        tries: u32,
        /// The error of the last attempt.
        last_error: Arc<anyhow::Error>,
    },
    /// The reconnector was stopped.
    #[error("reconnector stopped")]
    Stopped,
    /// The wait was cancelled by the caller.
    #[error("wait for connection cancelled")]
    Cancelled,
}
