//! Inbound duplicate filter.
//!
//! Recognises PUBLISH retransmissions from a client so that every QoS 1/2
//! message reaches the backend exactly once, while every copy still gets
//! its acknowledgment. A record lives from the first PUBLISH until the
//! codec confirms the terminal acknowledgment (PUBACK, or PUBCOMP after
//! PUBREL) was written.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::protocol::{AckPacket, ApplicationMessage, OutboundPacket, Qos};

/// Progress of an inbound flow that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InboundStage {
    /// QoS 1: PUBACK emitted, waiting for the codec to flush it.
    AwaitingAckFlush,
    /// QoS 2: PUBREC emitted, waiting for the client's PUBREL.
    AwaitingPubRel,
    /// QoS 2: PUBCOMP emitted, waiting for the codec to flush it.
    AwaitingPubCompFlush,
}

/// Terminal acknowledgments whose write completion retires a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushedAck {
    PubAck,
    PubComp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundDeliveryRecord {
    pub packet_id: u16,
    pub qos: Qos,
    pub stage: InboundStage,
    pub topic: String,
    /// Retransmissions seen for this identifier.
    pub duplicates: u32,
}

/// Per-connection filter keyed by inbound packet identifier.
#[derive(Debug)]
pub struct InboundDuplicateFilter {
    client_id: String,
    records: HashMap<u16, InboundDeliveryRecord>,
    suppressed: u64,
}

impl InboundDuplicateFilter {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            records: HashMap::new(),
            suppressed: 0,
        }
    }

    /// Rebuild the filter from records a persistent session handed over.
    pub fn restore(client_id: impl Into<String>, records: Vec<InboundDeliveryRecord>) -> Self {
        let mut filter = Self::new(client_id);
        filter.records = records.into_iter().map(|r| (r.packet_id, r)).collect();
        filter
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stage(&self, packet_id: u16) -> Option<InboundStage> {
        self.records.get(&packet_id).map(|r| r.stage)
    }

    /// Retransmissions swallowed so far.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// Handle an inbound PUBLISH.
    ///
    /// Returns the message when it must be forwarded to the backend, `None`
    /// for a retransmission. The matching acknowledgment is pushed to `out`
    /// either way. A PUBLISH is a retransmission when a record exists for
    /// its identifier and it carries DUP, or when the record still awaits
    /// PUBREL.
    pub fn on_publish(
        &mut self,
        message: ApplicationMessage,
        out: &mut Vec<OutboundPacket>,
    ) -> Option<ApplicationMessage> {
        if !message.qos.needs_ack() {
            return Some(message);
        }
        let Some(packet_id) = message.packet_id.filter(|id| *id != 0) else {
            tracing::warn!(
                client_id = %self.client_id,
                topic = %message.topic,
                "dropping QoS {} publish without packet identifier",
                message.qos.level()
            );
            return None;
        };

        if let Some(record) = self.records.get_mut(&packet_id) {
            // without DUP the client already saw our terminal ack and reused the identifier
            if !message.dup && record.stage != InboundStage::AwaitingPubRel {
                tracing::debug!(
                    client_id = %self.client_id,
                    packet_id,
                    stage = ?record.stage,
                    "identifier reused before ack flush confirmed; treating as new publish"
                );
                return self.first_publish(packet_id, message, out);
            }
            record.duplicates += 1;
            self.suppressed += 1;
            let ack = AckPacket::new(packet_id);
            out.push(match record.stage {
                InboundStage::AwaitingAckFlush => OutboundPacket::PubAck(ack),
                InboundStage::AwaitingPubRel => OutboundPacket::PubRec(ack),
                InboundStage::AwaitingPubCompFlush => OutboundPacket::PubComp(ack),
            });
            tracing::debug!(
                client_id = %self.client_id,
                packet_id,
                dup = message.dup,
                stage = ?record.stage,
                "client retransmitted publish; acknowledging without forwarding"
            );
            return None;
        }
        self.first_publish(packet_id, message, out)
    }

    fn first_publish(
        &mut self,
        packet_id: u16,
        message: ApplicationMessage,
        out: &mut Vec<OutboundPacket>,
    ) -> Option<ApplicationMessage> {
        let (stage, ack) = match message.qos {
            Qos::ExactlyOnce => (
                InboundStage::AwaitingPubRel,
                OutboundPacket::PubRec(AckPacket::new(packet_id)),
            ),
            _ => (
                InboundStage::AwaitingAckFlush,
                OutboundPacket::PubAck(AckPacket::new(packet_id)),
            ),
        };
        self.records.insert(
            packet_id,
            InboundDeliveryRecord {
                packet_id,
                qos: message.qos,
                stage,
                topic: message.topic.clone(),
                duplicates: 0,
            },
        );
        out.push(ack);
        tracing::trace!(
            client_id = %self.client_id,
            packet_id,
            "first publish for identifier; forwarding"
        );
        Some(message)
    }

    /// Answer a PUBREL. PUBCOMP is always sent, known identifier or not.
    pub fn on_pubrel(&mut self, ack: &AckPacket, out: &mut Vec<OutboundPacket>) {
        let packet_id = ack.packet_id;
        match self.records.get_mut(&packet_id) {
            Some(record) if record.stage == InboundStage::AwaitingPubRel => {
                record.stage = InboundStage::AwaitingPubCompFlush;
            }
            Some(record) if record.stage == InboundStage::AwaitingPubCompFlush => {}
            Some(record) => {
                tracing::debug!(
                    client_id = %self.client_id,
                    packet_id,
                    stage = ?record.stage,
                    "pubrel for identifier not awaiting it"
                );
            }
            None => {
                tracing::debug!(
                    client_id = %self.client_id,
                    packet_id,
                    "pubrel for unknown identifier; answering pubcomp"
                );
            }
        }
        out.push(OutboundPacket::PubComp(AckPacket::new(packet_id)));
    }

    /// The codec wrote a terminal acknowledgment; retire the record.
    pub fn on_ack_written(&mut self, ack: FlushedAck, packet_id: u16) -> bool {
        let retire = matches!(
            (ack, self.stage(packet_id)),
            (FlushedAck::PubAck, Some(InboundStage::AwaitingAckFlush))
                | (FlushedAck::PubComp, Some(InboundStage::AwaitingPubCompFlush))
        );
        if retire {
            self.records.remove(&packet_id);
            tracing::trace!(
                client_id = %self.client_id,
                packet_id,
                "inbound flow complete"
            );
        }
        retire
    }

    /// Hand all records over for a persistent session.
    pub fn take_records(&mut self) -> Vec<InboundDeliveryRecord> {
        let mut records: Vec<_> = self.records.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.packet_id);
        records
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::protocol::PayloadRef;

    fn publish(id: u16, qos: Qos) -> ApplicationMessage {
        ApplicationMessage::new("sensors/1", PayloadRef(id as u64), qos).with_packet_id(id)
    }

    #[test]
    fn qos1_retransmission_is_acked_but_not_forwarded() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();

        assert!(filter.on_publish(publish(42, Qos::AtLeastOnce), &mut out).is_some());
        assert!(filter
            .on_publish(publish(42, Qos::AtLeastOnce).as_duplicate(), &mut out)
            .is_none());
        assert_eq!(
            out,
            vec![
                OutboundPacket::PubAck(AckPacket::new(42)),
                OutboundPacket::PubAck(AckPacket::new(42)),
            ]
        );
        assert_eq!(filter.suppressed_count(), 1);

        assert!(filter.on_ack_written(FlushedAck::PubAck, 42));
        assert!(filter.is_empty());
        out.clear();
        // identifier reuse after the flow finished is a new message
        assert!(filter.on_publish(publish(42, Qos::AtLeastOnce), &mut out).is_some());
    }

    #[test]
    fn qos2_flow_resends_previous_stage_ack() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();

        assert!(filter.on_publish(publish(7, Qos::ExactlyOnce), &mut out).is_some());
        assert!(filter.on_publish(publish(7, Qos::ExactlyOnce), &mut out).is_none());
        filter.on_pubrel(&AckPacket::new(7), &mut out);
        assert!(filter
            .on_publish(publish(7, Qos::ExactlyOnce).as_duplicate(), &mut out)
            .is_none());
        filter.on_pubrel(&AckPacket::new(7), &mut out);

        assert_eq!(
            out,
            vec![
                OutboundPacket::PubRec(AckPacket::new(7)),
                OutboundPacket::PubRec(AckPacket::new(7)),
                OutboundPacket::PubComp(AckPacket::new(7)),
                OutboundPacket::PubComp(AckPacket::new(7)),
                OutboundPacket::PubComp(AckPacket::new(7)),
            ]
        );
        assert!(!filter.on_ack_written(FlushedAck::PubAck, 7));
        assert!(filter.on_ack_written(FlushedAck::PubComp, 7));
        assert_eq!(filter.stage(7), None);
    }

    #[test]
    fn pubrec_flush_does_not_retire_qos2_record() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();
        filter.on_publish(publish(3, Qos::ExactlyOnce), &mut out);
        assert!(!filter.on_ack_written(FlushedAck::PubComp, 3));
        assert_eq!(filter.stage(3), Some(InboundStage::AwaitingPubRel));
    }

    #[test]
    fn unknown_pubrel_still_gets_pubcomp() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();
        filter.on_pubrel(&AckPacket::new(99), &mut out);
        assert_eq!(out, vec![OutboundPacket::PubComp(AckPacket::new(99))]);
        assert!(filter.is_empty());
    }

    #[test]
    fn qos0_and_missing_identifiers() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();
        let qos0 = ApplicationMessage::new("t", PayloadRef(0), Qos::AtMostOnce);
        assert!(filter.on_publish(qos0.clone(), &mut out).is_some());
        assert!(filter.on_publish(qos0, &mut out).is_some());

        let no_id = ApplicationMessage::new("t", PayloadRef(0), Qos::AtLeastOnce);
        assert!(filter.on_publish(no_id, &mut out).is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn records_survive_handover() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();
        filter.on_publish(publish(2, Qos::ExactlyOnce), &mut out);
        filter.on_publish(publish(1, Qos::AtLeastOnce), &mut out);
        let records = filter.take_records();
        assert_eq!(records.iter().map(|r| r.packet_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(filter.is_empty());

        let mut resumed = InboundDuplicateFilter::restore("c1", records);
        out.clear();
        assert!(resumed.on_publish(publish(2, Qos::ExactlyOnce).as_duplicate(), &mut out).is_none());
        assert_eq!(out, vec![OutboundPacket::PubRec(AckPacket::new(2))]);
    }

    #[test]
    fn reused_identifier_without_dup_is_a_new_message() {
        let mut filter = InboundDuplicateFilter::new("c1");
        let mut out = Vec::new();

        // PUBACK reached the client but its flush was never confirmed
        filter.on_publish(publish(42, Qos::AtLeastOnce), &mut out);
        let next = ApplicationMessage::new("sensors/2", PayloadRef(2), Qos::AtLeastOnce)
            .with_packet_id(42);
        let forwarded = filter.on_publish(next, &mut out).map(|m| m.topic);
        assert_eq!(forwarded.as_deref(), Some("sensors/2"));
        assert_eq!(filter.suppressed_count(), 0);

        // same for a QoS 2 flow whose PUBCOMP flush is pending
        filter.on_publish(publish(8, Qos::ExactlyOnce), &mut out);
        filter.on_pubrel(&AckPacket::new(8), &mut out);
        assert!(filter.on_publish(publish(8, Qos::ExactlyOnce), &mut out).is_some());
        assert_eq!(filter.stage(8), Some(InboundStage::AwaitingPubRel));

        // while PUBREL is outstanding the flow is not finished, DUP or not
        assert!(filter.on_publish(publish(8, Qos::ExactlyOnce), &mut out).is_none());
        assert_eq!(filter.suppressed_count(), 1);
    }
}
