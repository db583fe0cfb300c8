//! REST snapshot source.
//!
//! Implements [`SnapshotSource`] on top of Binance's
//! `GET /api/v3/ticker/24hr?symbols=[...]`, fetching every tracked pair in
//! one request.

use std::time::Duration;

use async_trait::async_trait;

use super::codec::TickerCodec;
use super::messages::RestTicker;
use crate::application::ports::{SnapshotSource, SourceError};
use crate::domain::price::PriceRecord;
use crate::infrastructure::metrics;

/// Production REST base URL.
pub const DEFAULT_REST_URL: &str = "https://api.binance.com";

const TICKER_PATH: &str = "/api/v3/ticker/24hr";
const MAX_ERROR_BODY: usize = 256;

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Payload {
                message: e.to_string(),
            }
        } else {
            Self::Http {
                message: e.to_string(),
            }
        }
    }
}

/// Binance REST adapter for the polling path.
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    client: reqwest::Client,
    base_url: String,
    codec: TickerCodec,
}

impl RestSnapshotSource {
    /// Create a new REST source.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration, codec: TickerCodec) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            codec,
        })
    }

    async fn fetch_tickers(&self, pairs: &[String]) -> Result<Vec<RestTicker>, SourceError> {
        let symbols = serde_json::to_string(pairs).map_err(|e| SourceError::Payload {
            message: e.to_string(),
        })?;
        let url = format!("{}{TICKER_PATH}", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("symbols", symbols.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch(&self, pairs: &[String]) -> Result<Vec<PriceRecord>, SourceError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let tickers = self.fetch_tickers(pairs).await?;
        if tickers.is_empty() {
            return Err(SourceError::Payload {
                message: "response contained no tickers".to_string(),
            });
        }

        // One malformed ticker fails the whole poll, as one malformed element
        // fails a whole stream frame.
        let mut records = Vec::with_capacity(tickers.len());
        for ticker in &tickers {
            match self.codec.decode_rest(ticker) {
                Ok(record) => records.push(record),
                Err(e) => {
                    metrics::record_decode_error(e.kind());
                    return Err(SourceError::Payload {
                        message: format!("{}: {e}", ticker.symbol),
                    });
                }
            }
        }

        Ok(records)
    }
}
