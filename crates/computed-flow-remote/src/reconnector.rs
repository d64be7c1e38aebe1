//! Keeps a connection alive: connect, wait until it is dropped, classify the
//! failure, back off, and connect again.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

use crate::{ExponentialDelays, ReconnectError, RetryDelay, RetryDelays};

/// Opens connections of type `C`.
#[async_trait]
pub trait Connector<C>: Send + Sync + 'static {
    /// Open a connection. `try_index` counts the consecutive failures so far.
    async fn connect(&self, try_index: u32) -> Result<Arc<C>, anyhow::Error>;

    /// Runs after a successful connect, before the connection is handed out.
    /// A failure is treated like a failed connect.
    async fn on_connected(&self, _connection: &Arc<C>) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transiency {
    /// Retry after the next delay.
    Transient,
    /// Stop, unless the reconnector retries fatal errors.
    Fatal,
}

/// Classifies connection failures.
pub trait TransiencyResolver: Send + Sync + 'static {
    /// Classify `error`.
    fn resolve(&self, error: &anyhow::Error) -> Transiency;
}

impl<F> TransiencyResolver for F
where
    F: Fn(&anyhow::Error) -> Transiency + Send + Sync + 'static,
{
    fn resolve(&self, error: &anyhow::Error) -> Transiency {
        self(error)
    }
}

/// Treats every failure as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysTransient;

impl TransiencyResolver for AlwaysTransient {
    fn resolve(&self, _error: &anyhow::Error) -> Transiency {
        Transiency::Transient
    }
}

/// Reconnector behavior switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectorOptions {
    /// Keep retrying after failures classified as fatal.
    pub retry_fatal: bool,
}

/// Connection slot of a [`Reconnector`].
pub enum ConnectionState<C> {
    /// Waiting before the next attempt, or stopped.
    Disconnected,
    /// An attempt is in progress.
    Connecting,
    /// Connected.
    Connected(Arc<C>),
}

impl<C> Clone for ConnectionState<C> {
    fn clone(&self) -> Self {
        match self {
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            ConnectionState::Connecting => ConnectionState::Connecting,
            ConnectionState::Connected(connection) => ConnectionState::Connected(connection.clone()),
        }
    }
}

impl<C> fmt::Debug for ConnectionState<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Connected(_) => f.write_str("Connected"),
        }
    }
}

/// Snapshot of a [`Reconnector`].
pub struct ReconnectorStatus<C> {
    /// Current connection slot.
    pub state: ConnectionState<C>,
    /// Consecutive failures since the last clean connect.
    pub try_index: u32,
    /// The failure that ended the last connection or attempt.
    pub last_error: Option<Arc<anyhow::Error>>,
    /// When the next attempt is due, while waiting.
    pub reconnects_at: Option<Instant>,
    /// Why the reconnector stopped, once it has.
    pub stopped: Option<ReconnectError>,
}

impl<C> Clone for ReconnectorStatus<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            try_index: self.try_index,
            last_error: self.last_error.clone(),
            reconnects_at: self.reconnects_at,
            stopped: self.stopped.clone(),
        }
    }
}

impl<C> fmt::Debug for ReconnectorStatus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectorStatus")
            .field("state", &self.state)
            .field("try_index", &self.try_index)
            .field("last_error", &self.last_error)
            .field("reconnects_at", &self.reconnects_at)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl<C> ReconnectorStatus<C> {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Connecting,
            try_index: 0,
            last_error: None,
            reconnects_at: None,
            stopped: None,
        }
    }

    /// The current connection, if connected.
    pub fn connection(&self) -> Option<&Arc<C>> {
        match &self.state {
            ConnectionState::Connected(connection) => Some(connection),
            _ => None,
        }
    }
}

type Current<C> = Option<(Arc<C>, oneshot::Sender<anyhow::Error>)>;

struct Inner<C> {
    status: watch::Sender<ReconnectorStatus<C>>,
    current: Mutex<Current<C>>,
    try_index: AtomicU32,
    retry_now: Notify,
    cancel: CancellationToken,
}

impl<C> Inner<C> {
    fn publish(&self, update: impl FnOnce(&mut ReconnectorStatus<C>)) {
        self.status.send_modify(update);
    }

    fn finish(&self, reason: ReconnectError) {
        *self.current.lock() = None;
        self.publish(|status| {
            status.state = ConnectionState::Disconnected;
            status.reconnects_at = None;
            status.stopped = Some(reason);
        });
    }
}

struct Shared<C> {
    inner: Arc<Inner<C>>,
    _stop: DropGuard,
}

/// Maintains one live connection of type `C`.
///
/// The loop runs in a background task until [`Reconnector::stop`] is called,
/// the last handle is dropped, or a failure ends it for good.
pub struct Reconnector<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Reconnector<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Builder for [`Reconnector`].
pub struct ReconnectorBuilder<C> {
    connector: Arc<dyn Connector<C>>,
    resolver: Arc<dyn TransiencyResolver>,
    delays: Arc<dyn RetryDelays>,
    options: ReconnectorOptions,
}

impl<C: Send + Sync + 'static> ReconnectorBuilder<C> {
    /// Classify failures with `resolver`. Defaults to [`AlwaysTransient`].
    pub fn resolver(mut self, resolver: impl TransiencyResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Wait `delays` between attempts. Defaults to [`ExponentialDelays`].
    pub fn delays(mut self, delays: impl RetryDelays) -> Self {
        self.delays = Arc::new(delays);
        self
    }

    /// Set the options.
    pub fn options(mut self, options: ReconnectorOptions) -> Self {
        self.options = options;
        self
    }

    /// Keep retrying after fatal failures.
    pub fn retry_fatal(mut self, retry_fatal: bool) -> Self {
        self.options.retry_fatal = retry_fatal;
        self
    }

    /// Spawn the reconnect loop on the current tokio runtime.
    pub fn start(self) -> Reconnector<C> {
        let (status, _) = watch::channel(ReconnectorStatus::initial());
        let cancel = CancellationToken::new();
        let inner = Arc::new(Inner {
            status,
            current: Mutex::new(None),
            try_index: AtomicU32::new(0),
            retry_now: Notify::new(),
            cancel: cancel.clone(),
        });
        tokio::spawn(run(inner.clone(), self));
        Reconnector {
            shared: Arc::new(Shared {
                inner,
                _stop: cancel.drop_guard(),
            }),
        }
    }
}

impl<C: Send + Sync + 'static> Reconnector<C> {
    /// Start building a reconnector around `connector`.
    pub fn builder(connector: impl Connector<C>) -> ReconnectorBuilder<C> {
        ReconnectorBuilder {
            connector: Arc::new(connector),
            resolver: Arc::new(AlwaysTransient),
            delays: Arc::new(ExponentialDelays::default()),
            options: ReconnectorOptions::default(),
        }
    }

    /// Start a reconnector with explicit parts.
    pub fn start(
        connector: impl Connector<C>,
        resolver: impl TransiencyResolver,
        delays: impl RetryDelays,
        options: ReconnectorOptions,
    ) -> Self {
        Self::builder(connector)
            .resolver(resolver)
            .delays(delays)
            .options(options)
            .start()
    }

    fn inner(&self) -> &Inner<C> {
        &self.shared.inner
    }

    /// The current connection, waiting for one if necessary.
    pub async fn get_connection(&self, cancel: &CancellationToken) -> Result<Arc<C>, ReconnectError> {
        let mut status = self.inner().status.subscribe();
        loop {
            {
                let current = status.borrow_and_update();
                if let Some(reason) = &current.stopped {
                    return Err(reason.clone());
                }
                if let Some(connection) = current.connection() {
                    return Ok(connection.clone());
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(ReconnectError::Stopped);
                    }
                }
            }
        }
    }

    /// Drop `connection` because of `error`, if it is still the current one.
    ///
    /// Returns false if the reconnector already moved on from it.
    pub fn drop_connection(&self, connection: &Arc<C>, error: anyhow::Error) -> bool {
        let mut current = self.inner().current.lock();
        match current.take() {
            Some((held, dropped)) if Arc::ptr_eq(&held, connection) => {
                debug!(error = %error, "dropping connection");
                let _ = dropped.send(error);
                true
            }
            other => {
                *current = other;
                false
            }
        }
    }

    /// Forget the consecutive failures; the next delay starts over.
    pub fn reset_try_index(&self) {
        self.inner().try_index.store(0, Ordering::SeqCst);
        self.inner().publish(|status| status.try_index = 0);
    }

    /// Skip the current retry delay.
    pub fn retry_now(&self) {
        self.inner().retry_now.notify_waiters();
    }

    /// Current status.
    pub fn status(&self) -> ReconnectorStatus<C> {
        self.inner().status.borrow().clone()
    }

    /// Receiver following every status change.
    pub fn watch_status(&self) -> watch::Receiver<ReconnectorStatus<C>> {
        self.inner().status.subscribe()
    }

    /// Stop the loop and drop the current connection.
    pub fn stop(&self) {
        self.inner().cancel.cancel();
    }

    /// Returns true once the loop has stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner().status.borrow().stopped.is_some()
    }
}

async fn connect_once<C: Send + Sync + 'static>(
    connector: &dyn Connector<C>,
    try_index: u32,
) -> Result<Arc<C>, anyhow::Error> {
    let connection = connector.connect(try_index).await?;
    connector.on_connected(&connection).await?;
    Ok(connection)
}

async fn run<C: Send + Sync + 'static>(inner: Arc<Inner<C>>, parts: ReconnectorBuilder<C>) {
    let cancel = inner.cancel.clone();
    loop {
        let try_index = inner.try_index.load(Ordering::SeqCst);
        inner.publish(|status| {
            status.state = ConnectionState::Connecting;
            status.reconnects_at = None;
        });

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                inner.finish(ReconnectError::Stopped);
                return;
            }
            attempt = connect_once(parts.connector.as_ref(), try_index) => attempt,
        };

        let failure = match attempt {
            Ok(connection) => {
                let (dropped_tx, dropped_rx) = oneshot::channel();
                *inner.current.lock() = Some((connection.clone(), dropped_tx));
                inner.try_index.store(0, Ordering::SeqCst);
                inner.publish(|status| {
                    status.state = ConnectionState::Connected(connection);
                    status.try_index = 0;
                    status.last_error = None;
                });
                debug!(try_index, "connected");

                let failure = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        inner.finish(ReconnectError::Stopped);
                        return;
                    }
                    dropped = dropped_rx => dropped
                        .unwrap_or_else(|_| anyhow::anyhow!("connection slot was released")),
                };
                *inner.current.lock() = None;
                failure
            }
            Err(failure) => failure,
        };

        let failure = Arc::new(failure);
        let transiency = parts.resolver.resolve(&failure);
        if transiency == Transiency::Fatal && !parts.options.retry_fatal {
            error!(error = %failure, "fatal connection error, giving up");
            inner.finish(ReconnectError::Fatal(failure));
            return;
        }

        let try_index = inner.try_index.load(Ordering::SeqCst);
        let delay = match parts.delays.delay(try_index) {
            RetryDelay::After(delay) => delay,
            RetryDelay::LimitExceeded => {
                error!(try_index, error = %failure, "reconnect limit exceeded");
                inner.finish(ReconnectError::RetryLimitExceeded {
                    tries: try_index + 1,
                    last_error: failure,
                });
                return;
            }
        };
        let next = try_index + 1;
        inner.try_index.store(next, Ordering::SeqCst);
        inner.publish(|status| {
            status.state = ConnectionState::Disconnected;
            status.try_index = next;
            status.last_error = Some(failure.clone());
            status.reconnects_at = Some(Instant::now() + delay);
        });
        warn!(try_index = next, ?delay, ?transiency, error = %failure, "connection lost, reconnecting");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                inner.finish(ReconnectError::Stopped);
                return;
            }
            _ = inner.retry_now.notified() => debug!("retrying early"),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
