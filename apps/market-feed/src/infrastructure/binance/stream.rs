//! Ticker Stream Client
//!
//! Holds the persistent WebSocket connection to Binance's 24h ticker stream
//! and reconnects with exponential backoff when it drops.
//!
//! # Stream URL
//!
//! One raw-stream connection carries every tracked pair:
//! `wss://stream.binance.com:9443/ws/btcusdt@ticker/ethusdt@ticker`
//!
//! # Protocol
//!
//! No handshake or subscribe message is needed; the server starts pushing
//! ticker JSON as soon as the socket opens. Server pings are answered with
//! pongs. Frames are forwarded undecoded to the ingest task.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use crate::application::ports::FeedEvent;
use crate::domain::price::TrackedSymbols;
use crate::domain::status::{ConnectionStatus, StatusCause};
use crate::infrastructure::metrics;

/// Production raw-stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the stream client.
#[derive(Debug, thiserror::Error)]
pub enum StreamClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Automatic reconnection gave up.
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the stream client.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Full WebSocket URL including the stream path.
    pub url: String,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
}

impl StreamClientConfig {
    /// Build the ticker URL for every tracked pair under `base_url`.
    #[must_use]
    pub fn for_symbols(base_url: &str, tracked: &TrackedSymbols, reconnect: ReconnectConfig) -> Self {
        let streams = tracked
            .pairs()
            .iter()
            .map(|pair| format!("{}@ticker", pair.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");

        Self {
            url: format!("{}/{streams}", base_url.trim_end_matches('/')),
            reconnect,
        }
    }
}

// =============================================================================
// Stream Client
// =============================================================================

/// WebSocket client for the ticker stream.
///
/// Manages the connection lifecycle:
/// - Status reporting (`connecting`, `connected`, `disconnected`)
/// - Automatic reconnection with exponential backoff
/// - Ping/pong keepalive
pub struct StreamClient {
    config: StreamClientConfig,
    event_tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
}

impl StreamClient {
    /// Create a new stream client.
    #[must_use]
    pub const fn new(
        config: StreamClientConfig,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            cancel,
        }
    }

    /// Run the connection loop until cancelled or retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StreamClientError::Reconnect`] once the
    /// reconnect policy gives up. Cancellation returns `Ok(())`.
    pub async fn run(self: Arc<Self>) -> Result<(), StreamClientError> {
        let mut reconnect_policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Ticker stream client cancelled");
                return Ok(());
            }

            self.emit(FeedEvent::status(
                ConnectionStatus::Connecting,
                StatusCause::Connecting,
            ))
            .await;

            match self.connect_and_run(&mut reconnect_policy).await {
                Ok(()) => {
                    tracing::info!("Ticker stream closed on request");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Ticker stream connection error");

                    self.emit(FeedEvent::status(
                        ConnectionStatus::Disconnected,
                        StatusCause::TransportLost,
                    ))
                    .await;

                    if let Some(delay) = reconnect_policy.next_delay() {
                        let attempt = reconnect_policy.attempt_count();
                        metrics::record_reconnect();
                        tracing::info!(
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Reconnecting to ticker stream"
                        );

                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                tracing::info!("Ticker stream client cancelled during reconnect delay");
                                return Ok(());
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        let attempts = reconnect_policy.attempt_count();
                        metrics::record_retries_exhausted();
                        tracing::error!(attempts, "Giving up on ticker stream");

                        self.emit(FeedEvent::status(
                            ConnectionStatus::Disconnected,
                            StatusCause::RetriesExhausted { attempts },
                        ))
                        .await;

                        return Err(ReconnectError::MaxAttemptsExceeded(attempts).into());
                    }
                }
            }
        }
    }

    /// Connect and pump frames until error or cancellation.
    async fn connect_and_run(
        &self,
        reconnect_policy: &mut ReconnectPolicy,
    ) -> Result<(), StreamClientError> {
        tracing::info!(url = %self.config.url, "Connecting to ticker stream");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(&self.config.url) => result?,
        };

        reconnect_policy.reset();
        tracing::info!("Ticker stream connected");
        self.emit(FeedEvent::status(
            ConnectionStatus::Connected,
            StatusCause::Opened,
        ))
        .await;

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.emit(FeedEvent::Frame(text.as_str().to_owned())).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            match String::from_utf8(data.to_vec()) {
                                Ok(text) => self.emit(FeedEvent::Frame(text)).await,
                                Err(e) => {
                                    metrics::record_decode_error("utf8");
                                    tracing::warn!(error = %e, "Dropping non UTF-8 binary frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Server sent close frame");
                            return Err(StreamClientError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // Pong / raw frames
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("WebSocket stream ended");
                            return Err(StreamClientError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    async fn emit(&self, event: FeedEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::trace!("Ingest task gone, dropping stream event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn url_lists_every_pair() {
        let tracked = TrackedSymbols::new(["BTC", "eth"], "USDT");
        let config =
            StreamClientConfig::for_symbols(DEFAULT_STREAM_URL, &tracked, ReconnectConfig::default());

        assert_eq!(
            config.url,
            "wss://stream.binance.com:9443/ws/btcusdt@ticker/ethusdt@ticker"
        );
    }

    #[test]
    fn url_tolerates_trailing_slash() {
        let tracked = TrackedSymbols::new(["SOL"], "USDT");
        let config =
            StreamClientConfig::for_symbols("ws://127.0.0.1:9000/ws/", &tracked, ReconnectConfig::default());
        assert_eq!(config.url, "ws://127.0.0.1:9000/ws/solusdt@ticker");
    }

    #[tokio::test]
    async fn cancelled_client_exits_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = Arc::new(StreamClient::new(
            StreamClientConfig {
                url: "ws://127.0.0.1:1/ws".to_string(),
                reconnect: ReconnectConfig::new(Duration::from_millis(10), 1),
            },
            tx,
            cancel,
        ));

        assert!(client.run().await.is_ok());
        assert!(rx.try_recv().is_err());
    }

    /// Local server that records when each connection is accepted. With
    /// `upgrade` set the WebSocket handshake completes before the socket is
    /// dropped; otherwise the TCP connection is dropped straight away.
    async fn dropping_server(upgrade: bool) -> (String, Arc<Mutex<Vec<Instant>>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                log.lock().push(Instant::now());
                if upgrade {
                    drop(tokio_tungstenite::accept_async(socket).await);
                }
            }
        });

        (format!("ws://{addr}/ws"), accepted)
    }

    fn client_for(
        url: String,
        base: Duration,
        max_attempts: u32,
    ) -> (Arc<StreamClient>, mpsc::Receiver<FeedEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let client = Arc::new(StreamClient::new(
            StreamClientConfig {
                url,
                reconnect: ReconnectConfig::new(base, max_attempts),
            },
            tx,
            cancel.clone(),
        ));
        (client, rx, cancel)
    }

    fn status_causes(rx: &mut mpsc::Receiver<FeedEvent>) -> Vec<StatusCause> {
        let mut causes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FeedEvent::Status { cause, .. } = event {
                causes.push(cause);
            }
        }
        causes
    }

    #[tokio::test]
    async fn successful_open_resets_backoff() {
        let base = Duration::from_millis(150);
        let (url, accepted) = dropping_server(true).await;
        // One retry per outage: without a reset the second drop would exhaust.
        let (client, mut rx, cancel) = client_for(url, base, 1);
        let handle = tokio::spawn(client.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client stopped reconnecting");
        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());

        let times = accepted.lock().clone();
        for pair in times.windows(2).take(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= base - Duration::from_millis(5), "gap {gap:?} shorter than base");
            assert!(gap < base * 2 - Duration::from_millis(20), "gap {gap:?} was not reset to base");
        }

        let causes = status_causes(&mut rx);
        assert!(causes.iter().filter(|c| **c == StatusCause::Opened).count() >= 3);
        assert!(!causes.iter().any(|c| matches!(c, StatusCause::RetriesExhausted { .. })));
    }

    #[tokio::test]
    async fn failed_handshakes_double_the_delay() {
        let base = Duration::from_millis(40);
        let (url, accepted) = dropping_server(false).await;
        let (client, mut rx, _cancel) = client_for(url, base, 3);

        let result = tokio::time::timeout(Duration::from_secs(5), client.run())
            .await
            .expect("client kept retrying");
        assert!(matches!(
            result,
            Err(StreamClientError::Reconnect(ReconnectError::MaxAttemptsExceeded(3)))
        ));

        let times = accepted.lock().clone();
        assert_eq!(times.len(), 4);
        for (n, pair) in times.windows(2).enumerate() {
            let expected = base * 2_u32.pow(u32::try_from(n).unwrap());
            let gap = pair[1] - pair[0];
            assert!(
                gap + Duration::from_millis(5) >= expected,
                "gap {n} was {gap:?}, expected {expected:?}"
            );
        }

        let causes = status_causes(&mut rx);
        assert!(!causes.contains(&StatusCause::Opened));
        assert_eq!(causes.last(), Some(&StatusCause::RetriesExhausted { attempts: 3 }));
    }
}
