//! Ticker Codec
//!
//! Turns Binance ticker payloads into [`PriceRecord`]s.
//!
//! Accepted text frames:
//! - a bare ticker event (`{"e":"24hrTicker",...}`)
//! - a combined-stream envelope (`{"stream":"btcusdt@ticker","data":{...}}`)
//! - an array of either (the `!ticker@arr` form)
//!
//! Control replies such as `{"result":null,"id":1}` and events of any other
//! type decode to an empty batch. A single malformed field rejects the whole
//! frame.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::price::{PriceRecord, TrackedSymbols};
use crate::infrastructure::binance::messages::{
    CombinedEnvelope, RawTicker, RestTicker, TICKER_EVENT_TYPE, TickerEvent,
};

/// Decoder errors.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// JSON parsing failed.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is valid JSON but not a shape we understand.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// A field could not be interpreted.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Wire name of the field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The exchange timestamp is out of range.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

impl DecodeError {
    /// Metric label for the error.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::InvalidFormat(_) => "format",
            Self::InvalidField { .. } => "field",
            Self::InvalidTimestamp(_) => "timestamp",
        }
    }
}

/// Decoder for the 24h ticker, stream and REST forms alike.
#[derive(Debug, Clone)]
pub struct TickerCodec {
    tracked: TrackedSymbols,
}

impl TickerCodec {
    /// Create a codec that canonicalizes pairs against `tracked`.
    #[must_use]
    pub const fn new(tracked: TrackedSymbols) -> Self {
        Self { tracked }
    }

    /// Decode one stream text frame into zero or more records.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, is not a recognized shape,
    /// or any ticker in it carries a malformed field.
    pub fn decode(&self, text: &str) -> Result<Vec<PriceRecord>, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;

        match value {
            serde_json::Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    records.extend(self.decode_value(item)?);
                }
                Ok(records)
            }
            serde_json::Value::Object(_) => self.decode_value(value),
            other => Err(DecodeError::InvalidFormat(format!(
                "expected JSON array or object, got: {}",
                truncate(&other.to_string())
            ))),
        }
    }

    /// Convert a REST ticker into a record.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is malformed.
    pub fn decode_rest(&self, ticker: &RestTicker) -> Result<PriceRecord, DecodeError> {
        self.build_record(RawTicker::from(ticker))
    }

    fn decode_value(&self, value: serde_json::Value) -> Result<Vec<PriceRecord>, DecodeError> {
        // Combined-stream envelope
        if value.get("stream").is_some() && value.get("data").is_some() {
            let envelope: CombinedEnvelope = serde_json::from_value(value)?;
            return self.decode_value(envelope.data);
        }

        // Subscription / control reply
        if value.get("id").is_some() && value.get("e").is_none() {
            return Ok(Vec::new());
        }

        match value.get("e").and_then(serde_json::Value::as_str) {
            Some(TICKER_EVENT_TYPE) => {
                let event: TickerEvent = serde_json::from_value(value)?;
                Ok(vec![self.build_record(RawTicker::from(&event))?])
            }
            Some(_) => Ok(Vec::new()),
            None => Err(DecodeError::InvalidFormat(format!(
                "missing event type: {}",
                truncate(&value.to_string())
            ))),
        }
    }

    fn build_record(&self, raw: RawTicker<'_>) -> Result<PriceRecord, DecodeError> {
        if raw.pair.trim().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "symbol",
                reason: "empty".to_string(),
            });
        }

        let price = parse_decimal("price", raw.price)?;
        if price.is_sign_negative() && !price.is_zero() {
            return Err(DecodeError::InvalidField {
                field: "price",
                reason: format!("negative price {price}"),
            });
        }

        let updated_at = parse_timestamp(raw.timestamp_ms)?;

        Ok(PriceRecord {
            symbol: self.tracked.canonical(raw.pair),
            price,
            change: parse_decimal("change", raw.change)?,
            change_percent: parse_decimal("change_percent", raw.change_percent)?,
            high: parse_decimal("high", raw.high)?,
            low: parse_decimal("low", raw.low)?,
            volume: parse_decimal("volume", raw.volume)?,
            updated_at,
        })
    }
}

fn parse_decimal(field: &'static str, value: &str) -> Result<Decimal, DecodeError> {
    value
        .trim()
        .parse::<Decimal>()
        .map_err(|e| DecodeError::InvalidField {
            field,
            reason: format!("{e} ({})", truncate(value)),
        })
}

fn parse_timestamp(millis: i64) -> Result<DateTime<Utc>, DecodeError> {
    if millis <= 0 {
        return Err(DecodeError::InvalidTimestamp(millis));
    }
    DateTime::from_timestamp_millis(millis).ok_or(DecodeError::InvalidTimestamp(millis))
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(50) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
