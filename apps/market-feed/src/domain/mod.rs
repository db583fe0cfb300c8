//! Domain Layer - Price records, the canonical table and connection status.
//!
//! Pure types with no I/O. Serialization support only.

/// Price records, tracked symbols and the canonical table.
pub mod price;

/// Connection status and status events.
pub mod status;
