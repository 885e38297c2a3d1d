//! Operations and observability.
//!
//! - `telemetry` - Structured logging setup and metrics rendering

pub mod telemetry;

pub use telemetry::*;
