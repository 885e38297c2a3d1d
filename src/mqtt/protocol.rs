//! Decoded packet model exchanged with the wire codec.
//!
//! The engine never touches raw bytes: the codec hands it [`InboundPacket`]
//! values and serializes the [`OutboundPacket`] values it produces.

use serde::{Deserialize, Serialize};

/// Lowest valid packet identifier.
pub const MIN_PACKET_ID: u16 = 1;
/// Highest valid packet identifier.
pub const MAX_PACKET_ID: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// QoS 1 and 2 need packet-identifier correlation.
    pub fn needs_ack(self) -> bool {
        !matches!(self, Qos::AtMostOnce)
    }
}

/// Opaque handle to a payload owned by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadRef(pub u64);

/// One MQTT PUBLISH occurrence.
///
/// The identifier is assigned once, when the window admits the message, and
/// is kept for every retransmission of that message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub topic: String,
    pub payload: PayloadRef,
    pub qos: Qos,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub message_expiry_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl ApplicationMessage {
    pub fn new(topic: impl Into<String>, payload: PayloadRef, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain: false,
            dup: false,
            packet_id: None,
            message_expiry_interval: None,
            user_properties: Vec::new(),
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    /// Copy flagged as a retransmission of its identifier.
    pub fn as_duplicate(mut self) -> Self {
        self.dup = true;
        self
    }
}

/// MQTT 5 reason code carried by acknowledgment packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReasonCode(pub u8);

impl ReasonCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const NO_MATCHING_SUBSCRIBERS: Self = Self(0x10);
    pub const UNSPECIFIED_ERROR: Self = Self(0x80);
    pub const QUOTA_EXCEEDED: Self = Self(0x97);

    pub fn is_success(self) -> bool {
        self.0 < 0x80
    }
}

impl Default for ReasonCode {
    fn default() -> Self {
        Self::SUCCESS
    }
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share this body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckPacket {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub user_properties: Vec<(String, String)>,
}

impl AckPacket {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason_code: ReasonCode) -> Self {
        self.reason_code = reason_code;
        self
    }
}

/// Decoded packets the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    Publish(ApplicationMessage),
    PubAck(AckPacket),
    PubRec(AckPacket),
    PubRel(AckPacket),
    PubComp(AckPacket),
}

impl InboundPacket {
    pub fn label(&self) -> &'static str {
        match self {
            InboundPacket::Publish(_) => "publish",
            InboundPacket::PubAck(_) => "puback",
            InboundPacket::PubRec(_) => "pubrec",
            InboundPacket::PubRel(_) => "pubrel",
            InboundPacket::PubComp(_) => "pubcomp",
        }
    }
}

/// Packets the engine hands to the codec for serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPacket {
    Publish(ApplicationMessage),
    PubAck(AckPacket),
    PubRec(AckPacket),
    PubRel(AckPacket),
    PubComp(AckPacket),
    Disconnect(DisconnectReason),
}

impl OutboundPacket {
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            OutboundPacket::Publish(msg) => msg.packet_id,
            OutboundPacket::PubAck(ack)
            | OutboundPacket::PubRec(ack)
            | OutboundPacket::PubRel(ack)
            | OutboundPacket::PubComp(ack) => Some(ack.packet_id),
            OutboundPacket::Disconnect(_) => None,
        }
    }
}

/// MQTT 5.0 disconnect reason codes used when the engine gives up on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    SessionTakenOver = 0x8E,
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_code_success_boundary() {
        assert!(ReasonCode::SUCCESS.is_success());
        assert!(ReasonCode::NO_MATCHING_SUBSCRIBERS.is_success());
        assert!(!ReasonCode::UNSPECIFIED_ERROR.is_success());
        assert!(!ReasonCode::QUOTA_EXCEEDED.is_success());
    }

    #[test]
    fn duplicate_keeps_identifier() {
        let msg = ApplicationMessage::new("a/b", PayloadRef(9), Qos::AtLeastOnce).with_packet_id(5);
        let dup = msg.clone().as_duplicate();
        assert!(dup.dup);
        assert_eq!(dup.packet_id, msg.packet_id);
        assert_eq!(dup.topic, "a/b");
    }

    #[test]
    fn outbound_packet_id() {
        assert_eq!(
            OutboundPacket::PubRel(AckPacket::new(7)).packet_id(),
            Some(7)
        );
        assert_eq!(
            OutboundPacket::Disconnect(DisconnectReason::ProtocolError).packet_id(),
            None
        );
        assert_eq!(DisconnectReason::ProtocolError.code(), 0x82);
    }
}
