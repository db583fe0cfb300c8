//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, feed status, the current price table and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (200 only while connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /prices` - Every record, sorted by symbol
//! - `GET /prices/{symbol}` - One record, 404 if absent

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{FeedStats, MarketFeed};
use crate::domain::price::MarketSummary;
use crate::domain::status::{ConnectionStatus, StatusEvent};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Most recent status event.
    pub connection: StatusEvent,
    /// Feed counters.
    pub feed: FeedStats,
    /// Newest `updated_at` in the table.
    pub last_update: Option<DateTime<Utc>>,
    /// Aggregates over the table.
    pub summary: MarketSummary,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Data is flowing.
    Healthy,
    /// Connecting, or prices are being served from an earlier session.
    Degraded,
    /// No data source and nothing to serve.
    Unhealthy,
}

impl HealthStatus {
    /// Derive health from connection status and whether any prices are held.
    #[must_use]
    pub const fn from_feed(status: ConnectionStatus, has_prices: bool) -> Self {
        match (status, has_prices) {
            (ConnectionStatus::Connected, _) => Self::Healthy,
            (ConnectionStatus::Connecting, _) | (ConnectionStatus::Disconnected, true) => {
                Self::Degraded
            }
            (ConnectionStatus::Disconnected, false) => Self::Unhealthy,
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    feed: MarketFeed,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, feed: MarketFeed) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            feed,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the HTTP routes over the given state.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/prices", get(prices_handler))
        .route("/prices/{symbol}", get(price_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.feed.is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn prices_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.feed.get_all_snapshots())
}

async fn price_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    state
        .feed
        .get_snapshot(&symbol)
        .map_or_else(|| StatusCode::NOT_FOUND.into_response(), |record| Json(record).into_response())
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let snapshot = state.feed.snapshot();
    let connection = state.feed.status_event();

    HealthResponse {
        status: HealthStatus::from_feed(connection.status, !snapshot.is_empty()),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        connection,
        feed: state.feed.stats(),
        last_update: snapshot.latest_update(),
        summary: snapshot.summary(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
