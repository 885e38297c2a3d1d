//! Core engine infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Engine entry point and per-connection actors

pub mod config;
pub mod runtime;

pub use config::*;
pub use runtime::*;
