//! Application Services
//!
//! - `MarketFeed`: owns the session, the price table and both listener
//!   registries

mod market_feed;

pub use market_feed::{FeedError, FeedStats, MarketFeed};
