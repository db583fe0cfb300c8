//! Polling Fallback Source
//!
//! Periodically fetches the whole tracked set through a [`SnapshotSource`]
//! when push streaming is unavailable.
//!
//! # Timing
//!
//! - The first request goes out one interval after start.
//! - At most one request is in flight. A tick that fires while a request is
//!   outstanding is skipped (and counted), never queued.
//! - If no request has succeeded for `stale_threshold`, the poller reports
//!   `disconnected` with cause `Stale`. The deadline restarts on every
//!   success.
//!
//! A failed request is logged and counted but does not change status on its
//! own; only the stale deadline does.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedEvent, SnapshotSource, SourceError};
use crate::domain::price::PriceRecord;
use crate::domain::status::{ConnectionStatus, StatusCause};
use crate::infrastructure::metrics::{self, PollOutcome};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default age after which polled data counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

type PendingFetch = Pin<Box<dyn Future<Output = Result<Vec<PriceRecord>, SourceError>> + Send>>;

/// Poller timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Time without a successful poll before status goes `disconnected`.
    pub stale_threshold: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }
}

/// Periodic snapshot fetcher.
pub struct Poller {
    config: PollerConfig,
    source: Arc<dyn SnapshotSource>,
    pairs: Vec<String>,
    event_tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
}

impl Poller {
    /// Create a poller for the given exchange pairs.
    #[must_use]
    pub fn new(
        config: PollerConfig,
        source: Arc<dyn SnapshotSource>,
        pairs: Vec<String>,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            pairs,
            event_tx,
            cancel,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self) {
        let started = Instant::now();
        let mut ticker =
            tokio::time::interval_at(started + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stale = tokio::time::sleep_until(started + self.config.stale_threshold);
        tokio::pin!(stale);
        let mut stale_reported = false;
        let mut in_flight: Option<PendingFetch> = None;

        tracing::info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            stale_after_secs = self.config.stale_threshold.as_secs(),
            pairs = self.pairs.len(),
            "Starting ticker poller"
        );
        self.emit(FeedEvent::status(
            ConnectionStatus::Connecting,
            StatusCause::Connecting,
        ))
        .await;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    tracing::info!("Ticker poller cancelled");
                    return;
                }

                result = await_pending(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    match result {
                        Ok(records) => {
                            metrics::record_poll(PollOutcome::Success);
                            tracing::debug!(records = records.len(), "Poll succeeded");

                            stale.as_mut().reset(Instant::now() + self.config.stale_threshold);
                            stale_reported = false;

                            self.emit(FeedEvent::Snapshot(records)).await;
                            self.emit(FeedEvent::status(
                                ConnectionStatus::Connected,
                                StatusCause::Polled,
                            ))
                            .await;
                        }
                        Err(e) => {
                            metrics::record_poll(PollOutcome::Failure);
                            tracing::warn!(error = %e, "Poll failed");
                        }
                    }
                }

                () = &mut stale, if !stale_reported => {
                    stale_reported = true;
                    tracing::warn!(
                        threshold_secs = self.config.stale_threshold.as_secs(),
                        "No successful poll within stale threshold"
                    );
                    self.emit(FeedEvent::status(
                        ConnectionStatus::Disconnected,
                        StatusCause::Stale,
                    ))
                    .await;
                }

                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        metrics::record_poll_tick_skipped();
                        tracing::debug!("Poll still in flight, skipping tick");
                    } else {
                        in_flight = Some(self.start_fetch());
                    }
                }
            }
        }
    }

    fn start_fetch(&self) -> PendingFetch {
        let source = Arc::clone(&self.source);
        let pairs = self.pairs.clone();
        Box::pin(async move { source.fetch(&pairs).await })
    }

    async fn emit(&self, event: FeedEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::trace!("Ingest task gone, dropping poll event");
        }
    }
}

async fn await_pending(slot: &mut Option<PendingFetch>) -> Result<Vec<PriceRecord>, SourceError> {
    match slot.as_mut() {
        Some(fetch) => fetch.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::MockSnapshotSource;

    fn btc(price: i64) -> PriceRecord {
        PriceRecord {
            symbol: "BTC".to_string(),
            price: Decimal::from(price),
            change: Decimal::ZERO,
            change_percent: Decimal::ZERO,
            high: Decimal::from(price),
            low: Decimal::from(price),
            volume: Decimal::ONE,
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn spawn_poller(
        source: Arc<dyn SnapshotSource>,
    ) -> (mpsc::Receiver<FeedEvent>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let poller = Poller::new(
            PollerConfig::default(),
            source,
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            tx,
            cancel.clone(),
        );
        (rx, cancel, tokio::spawn(poller.run()))
    }

    fn drain(rx: &mut mpsc::Receiver<FeedEvent>) -> Vec<FeedEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn down() -> SourceError {
        SourceError::Http {
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_then_success() {
        let mut mock = MockSnapshotSource::new();
        let mut calls = 0;
        mock.expect_fetch().times(6).returning(move |_| {
            calls += 1;
            if calls <= 5 {
                Err(down())
            } else {
                Ok(vec![btc(42_000)])
            }
        });

        let (mut rx, cancel, handle) = spawn_poller(Arc::new(mock));

        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        handle.await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                FeedEvent::status(ConnectionStatus::Connecting, StatusCause::Connecting),
                FeedEvent::status(ConnectionStatus::Disconnected, StatusCause::Stale),
                FeedEvent::Snapshot(vec![btc(42_000)]),
                FeedEvent::status(ConnectionStatus::Connected, StatusCause::Polled),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_is_reported_once_while_down() {
        let mut mock = MockSnapshotSource::new();
        mock.expect_fetch().returning(|_| Err(down()));

        let (mut rx, cancel, handle) = spawn_poller(Arc::new(mock));

        tokio::time::sleep(Duration::from_secs(95)).await;
        cancel.cancel();
        handle.await.unwrap();

        let stale = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, FeedEvent::Status { cause: StatusCause::Stale, .. }))
            .count();
        assert_eq!(stale, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_restarts_stale_deadline() {
        let mut mock = MockSnapshotSource::new();
        let mut calls = 0;
        mock.expect_fetch().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(vec![btc(1)])
            } else {
                Err(down())
            }
        });

        let (mut rx, cancel, handle) = spawn_poller(Arc::new(mock));

        // Success at 5s pushes the deadline to 35s.
        tokio::time::sleep(Duration::from_secs(34)).await;
        let before: Vec<_> = drain(&mut rx);
        assert!(
            !before
                .iter()
                .any(|e| matches!(e, FeedEvent::Status { cause: StatusCause::Stale, .. }))
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![FeedEvent::status(
                ConnectionStatus::Disconnected,
                StatusCause::Stale
            )]
        );
    }

    struct SlowSource {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl SnapshotSource for SlowSource {
        async fn fetch(&self, _pairs: &[String]) -> Result<Vec<PriceRecord>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_during_inflight_request_are_skipped() {
        let source = Arc::new(SlowSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(12),
        });

        let (_rx, cancel, handle) = spawn_poller(Arc::clone(&source) as Arc<dyn SnapshotSource>);

        // Requests start at 5s and 20s; ticks at 10, 15, 25 and 30 are skipped.
        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_requested_before_first_interval() {
        let mut mock = MockSnapshotSource::new();
        mock.expect_fetch().times(0);

        let (mut rx, cancel, handle) = spawn_poller(Arc::new(mock));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![FeedEvent::status(
                ConnectionStatus::Connecting,
                StatusCause::Connecting
            )]
        );
    }
}
