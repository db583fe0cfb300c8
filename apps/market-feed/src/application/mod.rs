//! Application Layer - The feed facade and its port definitions.
//!
//! This layer wires acquisition adapters to the domain table and owns the
//! lifecycle a host drives.

/// Port interfaces for acquisition adapters.
pub mod ports;

/// The market feed service.
pub mod services;
