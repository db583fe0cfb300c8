//! Feed Configuration Settings
//!
//! Configuration types for the market feed, loaded from environment variables.

use std::time::Duration;

use crate::domain::price::TrackedSymbols;
use crate::infrastructure::binance::{
    DEFAULT_REST_URL, DEFAULT_STREAM_URL, ReconnectConfig, StreamClientConfig,
};
use crate::infrastructure::binance::reconnect::DEFAULT_MAX_ATTEMPTS;
use crate::infrastructure::poller::{DEFAULT_POLL_INTERVAL, DEFAULT_STALE_THRESHOLD, PollerConfig};

/// Symbols tracked when none are configured.
pub const DEFAULT_SYMBOLS: [&str; 6] = ["BTC", "ETH", "ADA", "SOL", "DOT", "AVAX"];

/// How the feed acquires prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FeedMode {
    /// Persistent WebSocket push stream.
    #[default]
    Stream,
    /// Periodic REST polling.
    Poll,
}

impl FeedMode {
    /// Parse mode from string. Unknown values fall back to `Stream`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "poll" | "polling" | "rest" => Self::Poll,
            _ => Self::Stream,
        }
    }

    /// Mode name for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
        }
    }
}

impl std::fmt::Display for FeedMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push stream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Raw-stream base URL; stream names are appended as path segments.
    pub url: String,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound on a single reconnection delay (`None` = uncapped).
    pub reconnect_max_delay: Option<Duration>,
    /// Additive jitter as a fraction of each delay.
    pub reconnect_jitter: f64,
    /// Consecutive reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: None,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// REST base URL.
    pub rest_url: String,
    /// Time between polls.
    pub interval: Duration,
    /// Time without a successful poll before status goes `disconnected`.
    pub stale_threshold: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            interval: DEFAULT_POLL_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Acquisition mode.
    pub mode: FeedMode,
    /// Canonical base symbols to track.
    pub symbols: Vec<String>,
    /// Quote asset appended to form exchange pairs.
    pub quote_asset: String,
    /// Push stream settings.
    pub stream: StreamSettings,
    /// Polling settings.
    pub poll: PollSettings,
    /// Capacity of the acquisition to ingest channel.
    pub event_capacity: usize,
    /// Server port settings.
    pub server: ServerSettings,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            mode: FeedMode::default(),
            symbols: DEFAULT_SYMBOLS.iter().map(|s| (*s).to_string()).collect(),
            quote_asset: "USDT".to_string(),
            stream: StreamSettings::default(),
            poll: PollSettings::default(),
            event_capacity: 1024,
            server: ServerSettings::default(),
        }
    }
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid (for
    /// example an empty symbol list).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mode = lookup("MARKET_FEED_MODE")
            .map(|s| FeedMode::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let symbols = match lookup("MARKET_FEED_SYMBOLS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.symbols,
        };

        let quote_asset = lookup("MARKET_FEED_QUOTE_ASSET")
            .map(|s| s.trim().to_uppercase())
            .unwrap_or(defaults.quote_asset);

        let stream = StreamSettings {
            url: lookup("MARKET_FEED_STREAM_URL").unwrap_or(defaults.stream.url),
            reconnect_base_delay: parse_duration_millis(
                &lookup,
                "MARKET_FEED_RECONNECT_BASE_MS",
                defaults.stream.reconnect_base_delay,
            ),
            reconnect_max_delay: parse(&lookup, "MARKET_FEED_RECONNECT_MAX_DELAY_SECS")
                .map(Duration::from_secs),
            reconnect_jitter: parse::<f64>(&lookup, "MARKET_FEED_RECONNECT_JITTER")
                .filter(|j| j.is_finite() && *j >= 0.0)
                .unwrap_or(defaults.stream.reconnect_jitter),
            max_reconnect_attempts: parse(&lookup, "MARKET_FEED_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.stream.max_reconnect_attempts),
        };

        let poll = PollSettings {
            rest_url: lookup("MARKET_FEED_REST_URL").unwrap_or(defaults.poll.rest_url),
            interval: parse_duration_millis(
                &lookup,
                "MARKET_FEED_POLL_INTERVAL_MS",
                defaults.poll.interval,
            ),
            stale_threshold: parse_duration_secs(
                &lookup,
                "MARKET_FEED_STALE_THRESHOLD_SECS",
                defaults.poll.stale_threshold,
            ),
            request_timeout: parse_duration_secs(
                &lookup,
                "MARKET_FEED_REQUEST_TIMEOUT_SECS",
                defaults.poll.request_timeout,
            ),
        };

        let config = Self {
            mode,
            symbols,
            quote_asset,
            stream,
            poll,
            event_capacity: parse(&lookup, "MARKET_FEED_EVENT_CAPACITY")
                .filter(|c: &usize| *c > 0)
                .unwrap_or(defaults.event_capacity),
            server: ServerSettings {
                health_port: parse(&lookup, "MARKET_FEED_HEALTH_PORT")
                    .unwrap_or(defaults.server.health_port),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise surface as runtime panics or a
    /// feed that can never track anything.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracked().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_FEED_SYMBOLS".to_string()));
        }
        if self.quote_asset.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_FEED_QUOTE_ASSET".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "MARKET_FEED_EVENT_CAPACITY".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.poll.interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "MARKET_FEED_POLL_INTERVAL_MS".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// The tracked symbol set.
    #[must_use]
    pub fn tracked(&self) -> TrackedSymbols {
        TrackedSymbols::new(&self.symbols, &self.quote_asset)
    }

    /// Reconnection policy settings.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        let mut config = ReconnectConfig::new(
            self.stream.reconnect_base_delay,
            self.stream.max_reconnect_attempts,
        )
        .with_jitter(self.stream.reconnect_jitter);
        if let Some(max_delay) = self.stream.reconnect_max_delay {
            config = config.with_max_delay(max_delay);
        }
        config
    }

    /// Stream client settings, including the full ticker URL.
    #[must_use]
    pub fn stream_client_config(&self) -> StreamClientConfig {
        StreamClientConfig::for_symbols(&self.stream.url, &self.tracked(), self.reconnect_config())
    }

    /// Poller timing.
    #[must_use]
    pub const fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: self.poll.interval,
            stale_threshold: self.poll.stale_threshold,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value is present but unusable.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    parse::<u64>(lookup, key).map_or(default, Duration::from_secs)
}

fn parse_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    parse::<u64>(lookup, key).map_or(default, Duration::from_millis)
}
