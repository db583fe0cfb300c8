//! Infrastructure Layer - Adapters and external integrations.
//!
//! Acquisition adapters that feed the application layer, plus the ambient
//! concerns (configuration, fan-out, health, metrics, tracing).

/// Binance ticker stream, REST snapshot source and wire codec.
pub mod binance;

/// Listener registries for update and status fan-out.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Interval polling over a snapshot source.
pub mod poller;

/// OpenTelemetry tracing integration.
pub mod telemetry;
