//! Configuration Module
//!
//! Environment-driven configuration for the market feed.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_SYMBOLS, FeedConfig, FeedMode, PollSettings, ServerSettings,
    StreamSettings,
};
