//! Binance Wire Types
//!
//! Deserialization targets for the 24h ticker, both as pushed over the
//! WebSocket stream and as returned by the REST `ticker/24hr` endpoint.
//! Binance encodes every decimal as a JSON string; the fields are kept as
//! strings here and parsed by the codec so a bad value can be reported with
//! its field name.
//!
//! # References
//!
//! - [Individual Symbol Ticker Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#individual-symbol-ticker-streams)
//! - [24hr Ticker Price Change Statistics](https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints#24hr-ticker-price-change-statistics)

use serde::{Deserialize, Serialize};

/// Event type carried by 24h ticker stream messages.
pub const TICKER_EVENT_TYPE: &str = "24hrTicker";

// =============================================================================
// Stream Messages
// =============================================================================

/// 24h rolling-window ticker pushed on `<symbol>@ticker`.
///
/// # Wire Format (JSON)
/// ```json
/// {
///   "e": "24hrTicker",
///   "E": 1672515782136,
///   "s": "BTCUSDT",
///   "p": "0.0015",
///   "P": "250.00",
///   "c": "0.0025",
///   "h": "0.0025",
///   "l": "0.0010",
///   "v": "10000",
///   "q": "18"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    /// Event type (always "24hrTicker")
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time in epoch milliseconds
    #[serde(rename = "E")]
    pub event_time: i64,

    /// Exchange pair (e.g., "BTCUSDT")
    #[serde(rename = "s")]
    pub symbol: String,

    /// Price change
    #[serde(rename = "p")]
    pub price_change: String,

    /// Price change percent
    #[serde(rename = "P")]
    pub price_change_percent: String,

    /// Last price
    #[serde(rename = "c")]
    pub last_price: String,

    /// High price
    #[serde(rename = "h")]
    pub high_price: String,

    /// Low price
    #[serde(rename = "l")]
    pub low_price: String,

    /// Total traded base asset volume
    #[serde(rename = "v")]
    pub volume: String,

    /// Total traded quote asset volume
    #[serde(rename = "q", default)]
    pub quote_volume: Option<String>,
}

/// Envelope used by the combined-stream endpoint (`/stream?streams=...`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CombinedEnvelope {
    /// Stream name (e.g., "btcusdt@ticker")
    pub stream: String,
    /// Wrapped payload
    pub data: serde_json::Value,
}

// =============================================================================
// REST Messages
// =============================================================================

/// One element of the `GET /api/v3/ticker/24hr?symbols=[...]` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTicker {
    /// Exchange pair (e.g., "BTCUSDT")
    pub symbol: String,
    /// Price change
    pub price_change: String,
    /// Price change percent
    pub price_change_percent: String,
    /// Last price
    pub last_price: String,
    /// High price
    pub high_price: String,
    /// Low price
    pub low_price: String,
    /// Base asset volume
    pub volume: String,
    /// Window close time in epoch milliseconds
    pub close_time: i64,
}

// =============================================================================
// Borrowed View
// =============================================================================

/// Field-level view shared by the stream and REST tickers.
#[derive(Debug, Clone, Copy)]
pub struct RawTicker<'a> {
    /// Exchange pair
    pub pair: &'a str,
    /// Last price
    pub price: &'a str,
    /// Absolute change
    pub change: &'a str,
    /// Percent change
    pub change_percent: &'a str,
    /// High
    pub high: &'a str,
    /// Low
    pub low: &'a str,
    /// Base volume
    pub volume: &'a str,
    /// Exchange timestamp in epoch milliseconds
    pub timestamp_ms: i64,
}

impl<'a> From<&'a TickerEvent> for RawTicker<'a> {
    fn from(event: &'a TickerEvent) -> Self {
        Self {
            pair: &event.symbol,
            price: &event.last_price,
            change: &event.price_change,
            change_percent: &event.price_change_percent,
            high: &event.high_price,
            low: &event.low_price,
            volume: &event.volume,
            timestamp_ms: event.event_time,
        }
    }
}

impl<'a> From<&'a RestTicker> for RawTicker<'a> {
    fn from(ticker: &'a RestTicker) -> Self {
        Self {
            pair: &ticker.symbol,
            price: &ticker.last_price,
            change: &ticker.price_change,
            change_percent: &ticker.price_change_percent,
            high: &ticker.high_price,
            low: &ticker.low_price,
            volume: &ticker.volume,
            timestamp_ms: ticker.close_time,
        }
    }
}
