//! Polling Fallback Integration Tests
//!
//! Runs a feed in poll mode against a mocked REST endpoint.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use market_feed::{
    ConnectionStatus, FeedConfig, FeedMode, MarketFeed, StatusCause, StatusEvent, Subscription,
};

const WAIT: Duration = Duration::from_secs(5);
const TICKER_PATH: &str = "/api/v3/ticker/24hr";

fn rest_ticker(pair: &str, price: &str, close_time: i64) -> serde_json::Value {
    json!({
        "symbol": pair,
        "priceChange": "-2.5",
        "priceChangePercent": "-0.8",
        "lastPrice": price,
        "highPrice": "320",
        "lowPrice": "290",
        "volume": "5000",
        "closeTime": close_time,
        "count": 1200
    })
}

fn poll_config(server: &MockServer) -> FeedConfig {
    let mut config = FeedConfig {
        mode: FeedMode::Poll,
        symbols: vec!["BTC".to_string(), "ETH".to_string()],
        ..FeedConfig::default()
    };
    config.poll.rest_url = server.uri();
    config.poll.interval = Duration::from_millis(50);
    config.poll.stale_threshold = Duration::from_millis(300);
    config.poll.request_timeout = Duration::from_secs(2);
    config
}

fn status_log(feed: &MarketFeed) -> (Subscription, mpsc::UnboundedReceiver<StatusEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = feed.subscribe_to_status(move |event| {
        let _ = tx.send(*event);
    });
    (sub, rx)
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
async fn poll_fills_table_and_connects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TICKER_PATH))
        .and(query_param("symbols", r#"["BTCUSDT","ETHUSDT"]"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            rest_ticker("BTCUSDT", "64000.10", 1_700_000_000_000_i64),
            rest_ticker("ETHUSDT", "3100", 1_700_000_000_000_i64),
        ])))
        .mount(&server)
        .await;

    let feed = MarketFeed::new(poll_config(&server)).unwrap();
    let (_status, mut statuses) = status_log(&feed);
    let mut updates = feed.updates_channel(8);
    feed.start().unwrap();

    let snapshot = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get("BTC").unwrap().price, Decimal::new(6_400_010, 2));
    assert_eq!(snapshot.get("ETH").unwrap().change_percent, Decimal::new(-8, 1));

    let connected = wait_for_status(&mut statuses, |e| e.status == ConnectionStatus::Connected).await;
    assert_eq!(connected.cause, StatusCause::Polled);

    let summary = feed.summary();
    assert_eq!(summary.losers, 2);
    assert_eq!(summary.total_volume, Decimal::from(10_000));

    feed.stop();
}

#[tokio::test]
async fn failing_upstream_goes_stale() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TICKER_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let feed = MarketFeed::new(poll_config(&server)).unwrap();
    let (_status, mut statuses) = status_log(&feed);
    feed.start().unwrap();

    wait_for_status(&mut statuses, |e| e.status == ConnectionStatus::Connecting).await;
    let stale = wait_for_status(&mut statuses, |e| e.status == ConnectionStatus::Disconnected).await;

    assert_eq!(stale.cause, StatusCause::Stale);
    assert!(feed.get_all_snapshots().is_empty());
    assert!(feed.is_running());
    assert!(!server.received_requests().await.unwrap().is_empty());

    feed.stop();
}

#[tokio::test]
async fn unchanged_timestamps_are_not_rebroadcast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TICKER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            rest_ticker("BTCUSDT", "64000", 1_700_000_000_000_i64),
        ])))
        .mount(&server)
        .await;

    let feed = MarketFeed::new(poll_config(&server)).unwrap();
    let mut updates = feed.updates_channel(8);
    feed.start().unwrap();

    timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(server.received_requests().await.unwrap().len() >= 2);
    assert!(updates.try_recv().is_err());

    feed.stop();
}

#[tokio::test]
async fn undecodable_response_is_not_a_successful_poll() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TICKER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            rest_ticker("BTCUSDT", "garbage", 1_700_000_000_000_i64),
            rest_ticker("ETHUSDT", "garbage", 1_700_000_000_000_i64),
        ])))
        .mount(&server)
        .await;

    let feed = MarketFeed::new(poll_config(&server)).unwrap();
    let (_status, mut statuses) = status_log(&feed);
    feed.start().unwrap();

    wait_for_status(&mut statuses, |e| e.status == ConnectionStatus::Connecting).await;
    let next = wait_for_status(&mut statuses, |e| e.status != ConnectionStatus::Connecting).await;

    assert_eq!(next.status, ConnectionStatus::Disconnected);
    assert_eq!(next.cause, StatusCause::Stale);
    assert!(feed.get_all_snapshots().is_empty());
    assert!(server.received_requests().await.unwrap().len() >= 2);

    feed.stop();
}
