//! Correlation of client acknowledgments with admitted outbound messages.
//!
//! PUBACK finishes a QoS 1 flow, PUBREC moves a QoS 2 flow to its release
//! stage (the engine answers with PUBREL itself) and PUBCOMP finishes it.
//! Acknowledgments that match nothing are logged and ignored: duplicate and
//! late acknowledgments are normal around reconnects, and some clients
//! double-ack.

use super::delivery::DeliveryStatus;
use super::flow_control::{OutboundStage, OutboundWindow};
use super::packet_id::{PacketIdError, PacketIdPool};
use super::protocol::{AckPacket, ApplicationMessage, OutboundPacket};

/// What an acknowledgment did to the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Terminal acknowledgment; the flow is finished and its slot reused.
    Completed {
        packet_id: u16,
        status: DeliveryStatus,
        message: ApplicationMessage,
    },
    /// PUBREC accepted and PUBREL emitted.
    Released { packet_id: u16 },
    /// Nothing admitted matches this acknowledgment.
    Ignored { packet_id: u16, packet: &'static str },
}

/// Stateless: everything it correlates against lives in the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckCorrelator;

impl AckCorrelator {
    pub fn on_puback(
        ack: &AckPacket,
        window: &mut OutboundWindow,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<Correlation, PacketIdError> {
        if window.stage(ack.packet_id) != Some(OutboundStage::AwaitingPubAck) {
            return Ok(Self::ignore(ack.packet_id, "puback", window));
        }
        Self::finish(ack.packet_id, DeliveryStatus::Delivered, window, pool, out)
    }

    pub fn on_pubrec(
        ack: &AckPacket,
        window: &mut OutboundWindow,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<Correlation, PacketIdError> {
        let packet_id = ack.packet_id;
        match window.stage(packet_id) {
            Some(OutboundStage::AwaitingPubRec) if ack.reason_code.is_success() => {
                window.mark_released(packet_id);
                out.push(OutboundPacket::PubRel(AckPacket::new(packet_id)));
                Ok(Correlation::Released { packet_id })
            }
            Some(OutboundStage::AwaitingPubRec) => {
                tracing::debug!(
                    packet_id,
                    reason = ack.reason_code.0,
                    "pubrec refused outbound message"
                );
                Self::finish(packet_id, DeliveryStatus::Dropped, window, pool, out)
            }
            Some(OutboundStage::AwaitingPubComp) if ack.reason_code.is_success() => {
                // our PUBREL may have been lost; answering again is harmless
                out.push(OutboundPacket::PubRel(AckPacket::new(packet_id)));
                Ok(Correlation::Released { packet_id })
            }
            _ => Ok(Self::ignore(packet_id, "pubrec", window)),
        }
    }

    pub fn on_pubcomp(
        ack: &AckPacket,
        window: &mut OutboundWindow,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<Correlation, PacketIdError> {
        if window.stage(ack.packet_id) != Some(OutboundStage::AwaitingPubComp) {
            return Ok(Self::ignore(ack.packet_id, "pubcomp", window));
        }
        Self::finish(ack.packet_id, DeliveryStatus::Delivered, window, pool, out)
    }

    fn finish(
        packet_id: u16,
        status: DeliveryStatus,
        window: &mut OutboundWindow,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<Correlation, PacketIdError> {
        match window.complete(packet_id, status, pool, out)? {
            Some(message) => Ok(Correlation::Completed {
                packet_id,
                status,
                message,
            }),
            None => Ok(Self::ignore(packet_id, "completion", window)),
        }
    }

    fn ignore(packet_id: u16, packet: &'static str, window: &OutboundWindow) -> Correlation {
        tracing::debug!(
            packet_id,
            packet,
            stage = ?window.stage(packet_id),
            "ignoring acknowledgment for identifier not awaiting it"
        );
        Correlation::Ignored { packet_id, packet }
    }
}
