//! MQTT QoS 1/2 delivery engine.
//!
//! - `packet_id` - identifier pools and the broker-wide registry
//! - `flow_control` - outbound ordering and the in-flight window
//! - `acks` - PUBACK/PUBREC/PUBCOMP correlation
//! - `dedupe` - inbound duplicate filter
//! - `session` - per-connection state machine and teardown
//! - `persistence` - boundary with the message store
//! - `delivery` - delivery-status promises
//! - `protocol` - decoded packet model shared with the codec
//! - `metrics` - engine counters

pub mod acks;
pub mod dedupe;
pub mod delivery;
pub mod flow_control;
pub mod metrics;
pub mod packet_id;
pub mod persistence;
pub mod protocol;
pub mod session;

pub use acks::{AckCorrelator, Correlation};
pub use dedupe::{FlushedAck, InboundDeliveryRecord, InboundDuplicateFilter, InboundStage};
pub use delivery::{DeliveryPromise, DeliveryStatus, DeliveryStatusFuture};
pub use flow_control::{InflightRecord, OutboundStage, OutboundWindow, QueuedMessage};
pub use metrics::QosMetrics;
pub use packet_id::{PacketIdError, PacketIdPool, PacketIdRegistry, SharedPacketIdPool};
pub use persistence::{
    InboundEnvelope, InflightPersistence, MemoryPersistence, NoopPersistence, RedeliveryEntry,
};
pub use protocol::{
    AckPacket, ApplicationMessage, DisconnectReason, InboundPacket, OutboundPacket, PayloadRef,
    Qos, ReasonCode,
};
pub use session::{
    ConnectionError, ConnectionEvent, ConnectionId, ConnectionSettings, ConnectionState,
    InboundSink, SessionExpiry, SessionServices, TeardownSummary,
};
