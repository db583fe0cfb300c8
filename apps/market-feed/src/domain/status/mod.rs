//! Connection Status Types
//!
//! The single connection status owned by a running feed, plus the event
//! published to status listeners whenever it changes.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Connection status as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// A connection attempt (or first poll) is in progress.
    Connecting,
    /// Data is flowing.
    Connected,
    /// No live data: dropped, stale, exhausted, or stopped.
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    /// Lowercase name used in logs, metrics and JSON.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    /// Numeric encoding for the status gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the status was (re)published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StatusCause {
    /// `start()` was called.
    Starting,
    /// A new push connection attempt began.
    Connecting,
    /// The push connection opened.
    Opened,
    /// The push connection closed or failed.
    TransportLost,
    /// Automatic retries stopped after the configured number of attempts.
    RetriesExhausted {
        /// Attempts made since the last successful connection.
        attempts: u32,
    },
    /// A poll succeeded.
    Polled,
    /// No successful poll landed within the stale threshold.
    Stale,
    /// `stop()` was called.
    Stopped,
}

impl StatusCause {
    /// Whether this cause must be published even when the status value is
    /// unchanged.
    #[must_use]
    pub const fn always_publish(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// A status change delivered to status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    /// The new status.
    pub status: ConnectionStatus,
    /// What caused it.
    pub cause: StatusCause,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn now(status: ConnectionStatus, cause: StatusCause) -> Self {
        Self {
            status,
            cause,
            at: Utc::now(),
        }
    }

    /// The initial state of a feed that has never been started.
    #[must_use]
    pub fn idle() -> Self {
        Self::now(ConnectionStatus::Disconnected, StatusCause::Stopped)
    }

    /// Whether this event reports that automatic retries have stopped.
    #[must_use]
    pub const fn retries_exhausted(&self) -> bool {
        matches!(self.cause, StatusCause::RetriesExhausted { .. })
    }
}
