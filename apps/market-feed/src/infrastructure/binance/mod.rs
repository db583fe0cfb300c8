//! Binance Adapters
//!
//! - **Stream**: WebSocket client for the 24h ticker push stream
//! - **REST**: `ticker/24hr` snapshot source for the polling path
//! - **Codec**: shared JSON decoding into price records

pub mod codec;
pub mod messages;
pub mod reconnect;
pub mod rest;
pub mod stream;

pub use codec::{DecodeError, TickerCodec};
pub use messages::{CombinedEnvelope, RawTicker, RestTicker, TickerEvent};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
pub use rest::{DEFAULT_REST_URL, RestSnapshotSource};
pub use stream::{DEFAULT_STREAM_URL, StreamClient, StreamClientConfig, StreamClientError};
