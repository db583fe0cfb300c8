//! Stream Lifecycle Integration Tests
//!
//! Runs a feed in stream mode against a local WebSocket server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use market_feed::{
    ConnectionStatus, FeedConfig, FeedMode, MarketFeed, PriceSnapshot, StatusCause, StatusEvent,
};

const WAIT: Duration = Duration::from_secs(5);

fn ticker(pair: &str, price: &str, event_time: i64) -> String {
    serde_json::json!({
        "e": "24hrTicker",
        "E": event_time,
        "s": pair,
        "p": "1.5",
        "P": "1.2",
        "c": price,
        "h": "120",
        "l": "80",
        "v": "1000",
        "q": "100000"
    })
    .to_string()
}

fn stream_config(addr: SocketAddr) -> FeedConfig {
    let mut config = FeedConfig {
        mode: FeedMode::Stream,
        symbols: vec!["BTC".to_string(), "ETH".to_string()],
        ..FeedConfig::default()
    };
    config.stream.url = format!("ws://{addr}/ws");
    config.stream.reconnect_base_delay = Duration::from_millis(20);
    config.stream.max_reconnect_attempts = 3;
    config
}

/// Serve `frames` on every connection, wait for `release`, then send
/// `late_frames` and hold the socket open until the client leaves.
async fn spawn_server(
    frames: Vec<String>,
    late_frames: Vec<String>,
    release: Arc<Notify>,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let frames = frames.clone();
            let late_frames = late_frames.clone();
            let release = Arc::clone(&release);

            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                for frame in frames {
                    if ws.send(Message::text(frame)).await.is_err() {
                        return;
                    }
                }
                release.notified().await;
                for frame in late_frames {
                    let _ = ws.send(Message::text(frame)).await;
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    (addr, connections)
}

fn status_log(feed: &MarketFeed) -> (market_feed::Subscription, mpsc::UnboundedReceiver<StatusEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = feed.subscribe_to_status(move |event| {
        let _ = tx.send(*event);
    });
    (sub, rx)
}

async fn next_snapshot_with(
    updates: &mut market_feed::ChannelSubscription<PriceSnapshot>,
    symbol: &str,
) -> PriceSnapshot {
    timeout(WAIT, async {
        loop {
            let snapshot = updates.recv().await.expect("update channel closed");
            if snapshot.get(symbol).is_some() {
                return snapshot;
            }
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

async fn wait_for_status<F>(rx: &mut mpsc::UnboundedReceiver<StatusEvent>, matches: F) -> StatusEvent
where
    F: Fn(&StatusEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("status channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for status")
}

#[tokio::test]
async fn older_record_never_replaces_newer() {
    let frames = vec![
        ticker("BTCUSDT", "100", 10_000),
        ticker("BTCUSDT", "99", 9_000),
        ticker("ETHUSDT", "2000", 11_000),
    ];
    let (addr, _) = spawn_server(frames, Vec::new(), Arc::new(Notify::new())).await;

    let feed = MarketFeed::new(stream_config(addr)).unwrap();
    let (_status, mut statuses) = status_log(&feed);
    let mut updates = feed.updates_channel(16);
    feed.start().unwrap();

    wait_for_status(&mut statuses, |e| e.status == ConnectionStatus::Connected).await;
    let snapshot = next_snapshot_with(&mut updates, "ETH").await;

    assert_eq!(snapshot.get("BTC").unwrap().price, Decimal::from(100));
    assert_eq!(feed.get_snapshot("BTC").unwrap().price, Decimal::from(100));
    assert_eq!(feed.get_all_snapshots().len(), 2);

    feed.stop();
}

#[tokio::test]
async fn bad_frames_are_skipped() {
    let frames = vec![
        "not json".to_string(),
        r#"{"result":null,"id":1}"#.to_string(),
        ticker("DOGEUSDT", "0.1", 5_000),
        ticker("BTCUSDT", "42000.50", 6_000),
    ];
    let (addr, _) = spawn_server(frames, Vec::new(), Arc::new(Notify::new())).await;

    let feed = MarketFeed::new(stream_config(addr)).unwrap();
    let mut updates = feed.updates_channel(16);
    feed.start().unwrap();

    let snapshot = next_snapshot_with(&mut updates, "BTC").await;
    assert_eq!(snapshot.get("BTC").unwrap().price, Decimal::new(4_200_050, 2));
    assert!(feed.get_snapshot("DOGE").is_none());
    assert!(feed.is_connected());

    feed.stop();
}

#[tokio::test]
async fn second_start_keeps_one_connection() {
    let frames = vec![ticker("BTCUSDT", "100", 1_000)];
    let (addr, connections) = spawn_server(frames, Vec::new(), Arc::new(Notify::new())).await;

    let feed = MarketFeed::new(stream_config(addr)).unwrap();
    let mut updates = feed.updates_channel(16);
    feed.start().unwrap();
    feed.start().unwrap();

    next_snapshot_with(&mut updates, "BTC").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connections.load(Ordering::SeqCst), 1);
    feed.stop();
}

#[tokio::test]
async fn nothing_is_delivered_after_stop() {
    let release = Arc::new(Notify::new());
    let (addr, _) = spawn_server(
        vec![ticker("BTCUSDT", "100", 1_000)],
        vec![ticker("BTCUSDT", "101", 2_000), ticker("ETHUSDT", "2000", 2_000)],
        Arc::clone(&release),
    )
    .await;

    let feed = MarketFeed::new(stream_config(addr)).unwrap();
    let mut updates = feed.updates_channel(16);
    feed.start().unwrap();

    next_snapshot_with(&mut updates, "BTC").await;
    feed.stop();
    release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(updates.try_recv().is_err());
    assert_eq!(feed.get_snapshot("BTC").unwrap().price, Decimal::from(100));
    assert_eq!(feed.status(), ConnectionStatus::Disconnected);
    assert!(!feed.is_running());

    assert_eq!(feed.status_event().cause, StatusCause::Stopped);
}

#[tokio::test]
async fn refused_connection_exhausts_retries() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let feed = MarketFeed::new(stream_config(addr)).unwrap();
    let (_status, mut statuses) = status_log(&feed);
    feed.start().unwrap();

    let exhausted = wait_for_status(&mut statuses, StatusEvent::retries_exhausted).await;
    assert_eq!(exhausted.status, ConnectionStatus::Disconnected);
    assert_eq!(exhausted.cause, StatusCause::RetriesExhausted { attempts: 3 });
    assert!(!feed.is_running());

    // A manual start begins a fresh session.
    feed.start().unwrap();
    assert!(feed.is_running());
    wait_for_status(&mut statuses, |e| e.status == ConnectionStatus::Connecting).await;
    feed.stop();
}
