#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Feed - Real-Time Price Ingestion
//!
//! Keeps one canonical, always-current table of 24h ticker records for a
//! configured set of symbols, fed either by the Binance push stream or by
//! interval polling of the REST API, and fans every accepted update and
//! connection status change out to in-process listeners.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Price records and connection status
//!   - `price`: Records, tracked symbols, the canonical table, summaries
//!   - `status`: Connection status and status events
//!
//! - **Application**: The feed facade and its ports
//!   - `ports`: Snapshot source contract, acquisition events
//!   - `services`: `MarketFeed` lifecycle, reads and subscriptions
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Ticker stream client, REST source, codec, reconnect policy
//!   - `poller`: Interval polling with staleness detection
//!   - `broadcast`: Listener registries with cancellable subscriptions
//!   - `config`: Environment-driven configuration
//!   - `health`: Health check and price HTTP endpoints
//!
//! # Data Flow
//!
//! ```text
//! Binance WS stream ──┐
//!                     ├──► ingest ──► PriceTable
//! Binance REST poll ──┘      │
//!                            ├──► update listeners
//!                            └──► status listeners
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Price and status types with no I/O.
pub mod domain;

/// Application layer - The feed facade and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::price::{MarketSummary, PriceRecord, PriceSnapshot, TrackedSymbols};
pub use domain::status::{ConnectionStatus, StatusCause, StatusEvent};

// Feed facade
pub use application::ports::{FeedEvent, SnapshotSource, SourceError};
pub use application::services::{FeedError, FeedStats, MarketFeed};

// Subscriptions
pub use infrastructure::broadcast::{ChannelSubscription, Subscription};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedConfig, FeedMode, PollSettings, ServerSettings, StreamSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
