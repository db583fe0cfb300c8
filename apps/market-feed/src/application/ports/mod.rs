//! Port Interfaces
//!
//! Contracts between the feed core and its acquisition adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - `SnapshotSource`: one-shot fetch of the full tracked set (polling path)
//!
//! ## Internal Events
//!
//! - `FeedEvent`: what an acquisition task (stream client or poller) reports
//!   to the session's ingest task

use async_trait::async_trait;

use crate::domain::price::PriceRecord;
use crate::domain::status::{ConnectionStatus, StatusCause};

// =============================================================================
// Snapshot Source
// =============================================================================

/// Errors from a single snapshot fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The request could not be sent or timed out.
    #[error("request failed: {message}")]
    Http {
        /// Error details.
        message: String,
    },

    /// The upstream answered with a non-success status.
    #[error("upstream returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The response body could not be interpreted.
    #[error("invalid payload: {message}")]
    Payload {
        /// Error details.
        message: String,
    },
}

/// Port for fetching the latest state of every tracked symbol in one call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch current records for the given exchange pairs.
    ///
    /// Records for pairs the upstream does not know are simply absent.
    async fn fetch(&self, pairs: &[String]) -> Result<Vec<PriceRecord>, SourceError>;
}

// =============================================================================
// Feed Events
// =============================================================================

/// Message from an acquisition task to the ingest task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The acquisition task's view of connectivity changed.
    Status {
        /// New status.
        status: ConnectionStatus,
        /// Reason.
        cause: StatusCause,
    },
    /// A raw text frame from the push stream, not yet decoded.
    Frame(String),
    /// Records from one successful poll.
    Snapshot(Vec<PriceRecord>),
}

impl FeedEvent {
    /// Shorthand for a status event.
    #[must_use]
    pub const fn status(status: ConnectionStatus, cause: StatusCause) -> Self {
        Self::Status { status, cause }
    }
}
