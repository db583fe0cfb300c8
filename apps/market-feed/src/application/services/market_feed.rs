//! Market Feed Service
//!
//! The core object a host constructs and owns. It wires one acquisition
//! path (stream or poll) to the canonical price table and fans accepted
//! updates and status changes out to listeners.
//!
//! # Session Model
//!
//! `start()` creates a session: one cancellation token, one acquisition task
//! and one ingest task. The acquisition task only produces [`FeedEvent`]s;
//! the ingest task is the sole writer of the table and the only place
//! broadcasts originate.
//!
//! ```text
//! StreamClient / Poller --FeedEvent--> ingest --apply--> PriceTable
//!                                        |
//!                                        +--> update listeners
//!                                        +--> status listeners
//! ```
//!
//! # Dispatch Gate
//!
//! Table writes, broadcasts, subscribe-time replay and `stop()` all run
//! under one reentrant lock. The ingest path re-checks the session token
//! under that lock before every delivery, and `stop()` cancels the token
//! before taking it. Once `stop()` returns, no further update can reach a
//! listener. The lock is reentrant so listeners may call back into the feed
//! (including `stop()`).
//!
//! A status published by a status listener (for example a `start()` from a
//! `RetriesExhausted` callback) is queued and delivered once the current
//! status broadcast has reached every listener, so all listeners observe
//! status changes in the same order.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedEvent, SnapshotSource, SourceError};
use crate::domain::price::{Admission, MarketSummary, PriceRecord, PriceSnapshot, PriceTable};
use crate::domain::status::{ConnectionStatus, StatusCause, StatusEvent};
use crate::infrastructure::binance::{RestSnapshotSource, StreamClient, TickerCodec};
use crate::infrastructure::broadcast::{ChannelSubscription, ListenerRegistry, Subscription};
use crate::infrastructure::config::{ConfigError, FeedConfig, FeedMode};
use crate::infrastructure::metrics;
use crate::infrastructure::poller::Poller;

// =============================================================================
// Errors
// =============================================================================

/// Errors from constructing or starting a feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// `start()` was called outside a Tokio runtime.
    #[error("no Tokio runtime available; start() must run inside a runtime")]
    NoRuntime,

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The polling source could not be built.
    #[error("snapshot source unavailable: {0}")]
    Source(#[from] SourceError),

    /// Polling mode without a snapshot source.
    #[error("polling mode requires a snapshot source")]
    NoSource,
}

// =============================================================================
// Stats
// =============================================================================

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    /// Acquisition mode.
    pub mode: &'static str,
    /// Whether a session is active.
    pub running: bool,
    /// Current status.
    pub status: ConnectionStatus,
    /// Symbols with at least one accepted record.
    pub records: usize,
    /// Symbols configured for tracking.
    pub tracked: usize,
    /// Registered update listeners (callbacks and channels).
    pub update_listeners: usize,
    /// Registered status listeners.
    pub status_listeners: usize,
}

// =============================================================================
// Market Feed
// =============================================================================

struct Session {
    cancel: CancellationToken,
    acquisition: JoinHandle<()>,
    ingest: JoinHandle<()>,
}

impl Session {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.ingest.is_finished()
    }
}

struct Inner {
    config: FeedConfig,
    codec: TickerCodec,
    source: Option<Arc<dyn SnapshotSource>>,
    table: RwLock<PriceTable>,
    updates: ListenerRegistry<PriceSnapshot>,
    statuses: ListenerRegistry<StatusEvent>,
    status: Mutex<StatusEvent>,
    status_dispatch: Mutex<StatusDispatch>,
    session: Mutex<Option<Session>>,
    gate: ReentrantMutex<()>,
}

/// Status broadcast in progress, and the events published while it runs.
#[derive(Default)]
struct StatusDispatch {
    active: bool,
    pending: VecDeque<StatusEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

/// Real-time price feed with fan-out to listeners.
///
/// Cheap to clone; all clones share one table, one status and one session.
///
/// # Example
///
/// ```rust,no_run
/// use market_feed::{FeedConfig, MarketFeed};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let feed = MarketFeed::new(FeedConfig::default())?;
/// let _updates = feed.subscribe_to_updates(|snapshot| {
///     println!("{} symbols", snapshot.len());
/// });
/// feed.start()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MarketFeed {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MarketFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeed")
            .field("mode", &self.inner.config.mode)
            .field("status", &self.status())
            .field("records", &self.inner.table.read().len())
            .finish_non_exhaustive()
    }
}

impl MarketFeed {
    /// Create a feed. Polling mode gets a Binance REST source.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: FeedConfig) -> Result<Self, FeedError> {
        config.validate()?;
        let codec = TickerCodec::new(config.tracked());

        let source: Option<Arc<dyn SnapshotSource>> = match config.mode {
            FeedMode::Poll => Some(Arc::new(RestSnapshotSource::new(
                &config.poll.rest_url,
                config.poll.request_timeout,
                codec.clone(),
            )?)),
            FeedMode::Stream => None,
        };

        Ok(Self::build(config, codec, source))
    }

    /// Create a feed that polls through the given source.
    ///
    /// The source is used only when `config.mode` is [`FeedMode::Poll`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_snapshot_source(
        config: FeedConfig,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Self, FeedError> {
        config.validate()?;
        let codec = TickerCodec::new(config.tracked());
        Ok(Self::build(config, codec, Some(source)))
    }

    fn build(config: FeedConfig, codec: TickerCodec, source: Option<Arc<dyn SnapshotSource>>) -> Self {
        let table = PriceTable::new(config.tracked());
        Self {
            inner: Arc::new(Inner {
                config,
                codec,
                source,
                table: RwLock::new(table),
                updates: ListenerRegistry::new("updates"),
                statuses: ListenerRegistry::new("status"),
                status: Mutex::new(StatusEvent::idle()),
                status_dispatch: Mutex::new(StatusDispatch::default()),
                session: Mutex::new(None),
                gate: ReentrantMutex::new(()),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start acquiring prices. Does nothing if a session is already running.
    ///
    /// Never waits on network I/O: the connection or first poll happens on a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::NoRuntime`] outside a Tokio runtime.
    pub fn start(&self) -> Result<(), FeedError> {
        let _gate = self.inner.gate.lock();

        {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(Session::is_active) {
                tracing::debug!("Market feed already running");
                return Ok(());
            }

            let runtime = Handle::try_current().map_err(|_| FeedError::NoRuntime)?;
            let source = match self.inner.config.mode {
                FeedMode::Poll => Some(self.inner.source.clone().ok_or(FeedError::NoSource)?),
                FeedMode::Stream => None,
            };

            if let Some(previous) = slot.take() {
                previous.cancel.cancel();
            }

            let cancel = CancellationToken::new();
            let (event_tx, event_rx) = mpsc::channel(self.inner.config.event_capacity);

            let acquisition = match source {
                Some(source) => {
                    let poller = Poller::new(
                        self.inner.config.poller_config(),
                        source,
                        self.inner.config.tracked().pairs(),
                        event_tx,
                        cancel.clone(),
                    );
                    runtime.spawn(poller.run())
                }
                None => {
                    let client = Arc::new(StreamClient::new(
                        self.inner.config.stream_client_config(),
                        event_tx,
                        cancel.clone(),
                    ));
                    runtime.spawn(async move {
                        if let Err(e) = client.run().await {
                            tracing::warn!(error = %e, "Ticker stream stopped");
                        }
                    })
                }
            };

            let ingest = runtime.spawn(ingest_loop(
                Arc::downgrade(&self.inner),
                event_rx,
                cancel.clone(),
            ));

            *slot = Some(Session {
                cancel,
                acquisition,
                ingest,
            });
        }

        tracing::info!(
            mode = %self.inner.config.mode,
            symbols = ?self.inner.config.symbols,
            "Market feed started"
        );
        self.inner
            .set_status(ConnectionStatus::Connecting, StatusCause::Starting, || true);

        Ok(())
    }

    /// Stop acquiring prices.
    ///
    /// Closes the connection (or stops polling), cancels any pending retry
    /// and leaves the status `disconnected`. Once this returns, no further
    /// update is delivered to any listener.
    pub fn stop(&self) {
        let Some(session) = self.inner.session.lock().take() else {
            return;
        };
        session.cancel.cancel();

        let _gate = self.inner.gate.lock();
        self.inner
            .set_status(ConnectionStatus::Disconnected, StatusCause::Stopped, || true);

        if session.acquisition.is_finished() {
            tracing::info!("Market feed stopped (acquisition had already ended)");
        } else {
            tracing::info!("Market feed stopped");
        }
    }

    /// Stop, then start again. Resets the reconnect counter.
    ///
    /// # Errors
    ///
    /// See [`start`](Self::start).
    pub fn restart(&self) -> Result<(), FeedError> {
        self.stop();
        self.start()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Latest record for a symbol (case-insensitive).
    #[must_use]
    pub fn get_snapshot(&self, symbol: &str) -> Option<PriceRecord> {
        self.inner.table.read().get(symbol).cloned()
    }

    /// Every record, sorted by symbol.
    #[must_use]
    pub fn get_all_snapshots(&self) -> Vec<PriceRecord> {
        self.snapshot().to_sorted_vec()
    }

    /// Immutable view of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> PriceSnapshot {
        self.inner.table.read().snapshot()
    }

    /// Aggregates over the current table.
    #[must_use]
    pub fn summary(&self) -> MarketSummary {
        self.snapshot().summary()
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.lock().status
    }

    /// Current status with its cause and timestamp.
    #[must_use]
    pub fn status_event(&self) -> StatusEvent {
        *self.inner.status.lock()
    }

    /// Whether the status is `connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Whether a session is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.session.lock().as_ref().is_some_and(Session::is_active)
    }

    /// The configuration this feed was built with.
    #[must_use]
    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    /// Counters for health reporting.
    #[must_use]
    pub fn stats(&self) -> FeedStats {
        FeedStats {
            mode: self.inner.config.mode.as_str(),
            running: self.is_running(),
            status: self.status(),
            records: self.inner.table.read().len(),
            tracked: self.inner.table.read().tracked().len(),
            update_listeners: self.inner.updates.len(),
            status_listeners: self.inner.statuses.len(),
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Receive a snapshot of the whole table after every accepted batch.
    ///
    /// If the table is non-empty the listener first receives the current
    /// snapshot.
    pub fn subscribe_to_updates<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PriceSnapshot) + Send + Sync + 'static,
    {
        let _gate = self.inner.gate.lock();
        let current = self.snapshot();
        let replay = (!current.is_empty()).then_some(&current);
        self.inner.updates.register_replaying(listener, replay)
    }

    /// Receive every status change. The listener first receives the current
    /// status.
    pub fn subscribe_to_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        let _gate = self.inner.gate.lock();
        let current = self.status_event();
        self.inner.statuses.register_replaying(listener, Some(&current))
    }

    /// Receive snapshots through a bounded queue. When the queue is full the
    /// snapshot is dropped for this consumer only.
    pub fn updates_channel(&self, capacity: usize) -> ChannelSubscription<PriceSnapshot> {
        let _gate = self.inner.gate.lock();
        let current = self.snapshot();
        let replay = (!current.is_empty()).then_some(&current);
        self.inner.updates.channel(capacity.max(1), replay)
    }
}

// =============================================================================
// Ingest
// =============================================================================

impl Inner {
    /// Publish a status. Caller holds the gate.
    fn set_status<P>(&self, status: ConnectionStatus, cause: StatusCause, proceed: P)
    where
        P: FnMut() -> bool,
    {
        let event = StatusEvent::now(status, cause);
        {
            let mut current = self.status.lock();
            let changed = current.status != status || cause.always_publish();
            *current = event;
            if !changed {
                return;
            }
        }

        metrics::set_connection_status(self.config.mode, status);
        tracing::info!(status = %status, cause = ?cause, "Connection status changed");

        {
            let mut dispatch = self.status_dispatch.lock();
            if dispatch.active {
                dispatch.pending.push_back(event);
                return;
            }
            dispatch.active = true;
        }

        self.statuses.broadcast_while(&event, proceed);

        // Events queued by listeners of the broadcast above.
        loop {
            let next = {
                let mut dispatch = self.status_dispatch.lock();
                match dispatch.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        dispatch.active = false;
                        break;
                    }
                }
            };
            self.statuses.broadcast(&next);
        }
    }

    fn handle_event(&self, event: FeedEvent, cancel: &CancellationToken) {
        match event {
            FeedEvent::Frame(text) => {
                metrics::record_frame_received(self.config.mode);
                match self.codec.decode(&text) {
                    Ok(records) if records.is_empty() => {
                        tracing::trace!("Control frame ignored");
                    }
                    Ok(records) => self.apply_batch(records, cancel),
                    Err(e) => {
                        metrics::record_decode_error(e.kind());
                        tracing::warn!(error = %e, "Dropping undecodable frame");
                    }
                }
            }
            FeedEvent::Snapshot(records) => {
                metrics::record_frame_received(self.config.mode);
                self.apply_batch(records, cancel);
            }
            FeedEvent::Status { status, cause } => {
                let _gate = self.gate.lock();
                if cancel.is_cancelled() {
                    return;
                }
                if matches!(cause, StatusCause::RetriesExhausted { .. }) {
                    // Final event of this session; a listener may start a new one.
                    cancel.cancel();
                    self.set_status(status, cause, || true);
                } else {
                    self.set_status(status, cause, || !cancel.is_cancelled());
                }
            }
        }
    }

    fn apply_batch(&self, records: Vec<PriceRecord>, cancel: &CancellationToken) {
        let started = Instant::now();
        let _gate = self.gate.lock();
        if cancel.is_cancelled() {
            return;
        }

        let snapshot = {
            let mut table = self.table.write();
            let mut accepted = 0usize;
            for record in records {
                let symbol = record.symbol.clone();
                let updated_at = record.updated_at;
                let admission = table.apply(record);
                metrics::record_admission(&admission);
                match admission {
                    Admission::Accepted => accepted += 1,
                    Admission::Stale { stored } => {
                        tracing::debug!(%symbol, %updated_at, %stored, "Dropping out-of-order record");
                    }
                    Admission::Untracked => {
                        tracing::trace!(%symbol, "Dropping untracked symbol");
                    }
                }
            }
            if accepted == 0 {
                return;
            }
            table.snapshot()
        };

        self.updates
            .broadcast_while(&snapshot, || !cancel.is_cancelled());
        metrics::record_ingest_duration(started.elapsed());
    }
}

async fn ingest_loop(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<FeedEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event, &cancel);
    }

    tracing::debug!("Ingest task finished");
}

// =============================================================================
// Tests
// =============================================================================
