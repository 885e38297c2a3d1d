#![deny(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Type defaults
#![allow(clippy::default_trait_access)]
#![allow(clippy::implicit_hasher)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Error handling style
#![allow(clippy::result_large_err)]

//! Quantum QoS - MQTT QoS 1/2 delivery engine.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - `QosEngine`, connection actors and handles
//!
//! ## MQTT
//! - `mqtt::packet_id` - Packet identifier pools and registry
//! - `mqtt::flow_control` - Outbound ordering and in-flight window
//! - `mqtt::acks` - Acknowledgment correlation
//! - `mqtt::dedupe` - Inbound duplicate filter
//! - `mqtt::session` - Per-connection state machine
//! - `mqtt::persistence` - Persistence boundary
//!
//! ## Operations
//! - `ops::telemetry` - Logging and metrics rendering

// Core infrastructure
pub mod core;

// MQTT QoS engine
pub mod mqtt;

// Operations
pub mod ops;

// Re-exports for backward compatibility and convenience
pub use self::core::{config, runtime};
pub use mqtt::session;
pub use ops::telemetry;

pub use config::EngineConfig;
pub use mqtt::delivery::{DeliveryStatus, DeliveryStatusFuture};
pub use runtime::{Connection, ConnectionHandle, EngineError, QosEngine};
