//! Outbound ordering and in-flight window.
//!
//! Implements the Receive Maximum half of MQTT 5.0 flow control (sections
//! 3.1.2.11.4 and 4.9) for messages the broker sends to a client. At most
//! `window_size` QoS 1/2 messages hold a packet identifier at any time;
//! everything else waits in a FIFO queue and is admitted one message per
//! completed flow, so the wire order always equals the enqueue order.

use std::collections::{HashMap, VecDeque};

use super::delivery::{DeliveryPromise, DeliveryStatus};
use super::packet_id::{PacketIdError, PacketIdPool};
use super::protocol::{AckPacket, ApplicationMessage, OutboundPacket, Qos};

/// Acknowledgment an admitted message is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OutboundStage {
    /// QoS 1 PUBLISH sent.
    AwaitingPubAck,
    /// QoS 2 PUBLISH sent.
    AwaitingPubRec,
    /// QoS 2 PUBREL sent.
    AwaitingPubComp,
}

impl OutboundStage {
    pub fn initial(qos: Qos) -> Option<Self> {
        match qos {
            Qos::AtMostOnce => None,
            Qos::AtLeastOnce => Some(Self::AwaitingPubAck),
            Qos::ExactlyOnce => Some(Self::AwaitingPubRec),
        }
    }
}

/// One admitted message.
#[derive(Debug)]
pub struct InflightRecord {
    pub message: ApplicationMessage,
    pub stage: OutboundStage,
    /// Position in the connection's delivery order.
    pub sequence: u64,
    promise: DeliveryPromise,
}

impl InflightRecord {
    pub fn packet_id(&self) -> u16 {
        self.message.packet_id.unwrap_or_default()
    }

    pub fn is_observed(&self) -> bool {
        self.promise.is_observed()
    }

    pub fn resolve(self, status: DeliveryStatus) -> ApplicationMessage {
        self.promise.resolve(status);
        self.message
    }
}

/// Message waiting for window space.
#[derive(Debug)]
pub struct QueuedMessage {
    pub message: ApplicationMessage,
    /// Set for redelivered messages, which already hold their identifier.
    pub resume: Option<OutboundStage>,
    promise: DeliveryPromise,
}

impl QueuedMessage {
    pub fn new(message: ApplicationMessage, promise: DeliveryPromise) -> Self {
        Self {
            message,
            resume: None,
            promise,
        }
    }

    /// Redelivered message keeping its original identifier and stage.
    pub fn resumed(
        message: ApplicationMessage,
        stage: OutboundStage,
        promise: DeliveryPromise,
    ) -> Self {
        Self {
            message,
            resume: Some(stage),
            promise,
        }
    }

    pub fn is_observed(&self) -> bool {
        self.promise.is_observed()
    }

    pub fn resolve(self, status: DeliveryStatus) -> ApplicationMessage {
        self.promise.resolve(status);
        self.message
    }
}

/// Everything the window still held when the connection closed.
#[derive(Debug, Default)]
pub struct DrainedWindow {
    /// Admitted records in delivery order.
    pub inflight: Vec<InflightRecord>,
    /// Queued messages in enqueue order.
    pub queued: Vec<QueuedMessage>,
}

/// Per-connection outbound window controller.
#[derive(Debug)]
pub struct OutboundWindow {
    window_size: u16,
    inflight: HashMap<u16, InflightRecord>,
    pending: VecDeque<QueuedMessage>,
    next_sequence: u64,
    /// Admission is paused until a redelivery batch has been placed.
    held: bool,
}

impl OutboundWindow {
    pub fn new(window_size: u16) -> Self {
        Self {
            window_size: window_size.max(1),
            inflight: HashMap::new(),
            pending: VecDeque::new(),
            next_sequence: 0,
            held: false,
        }
    }

    pub fn window_size(&self) -> u16 {
        self.window_size
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.inflight.len() < usize::from(self.window_size)
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.inflight.contains_key(&packet_id)
    }

    pub fn stage(&self, packet_id: u16) -> Option<OutboundStage> {
        self.inflight.get(&packet_id).map(|r| r.stage)
    }

    pub fn record(&self, packet_id: u16) -> Option<&InflightRecord> {
        self.inflight.get(&packet_id)
    }

    /// Packet identifiers in delivery order.
    pub fn inflight_ids(&self) -> Vec<u16> {
        let mut records: Vec<_> = self.inflight.values().collect();
        records.sort_by_key(|r| r.sequence);
        records.iter().map(|r| r.packet_id()).collect()
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Stop admitting until [`OutboundWindow::resume`] places the redelivery batch.
    pub fn hold(&mut self) {
        self.held = true;
    }

    /// Queue a QoS 1/2 message and admit as much of the queue as fits.
    pub fn enqueue(
        &mut self,
        message: ApplicationMessage,
        promise: DeliveryPromise,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), PacketIdError> {
        debug_assert!(message.qos.needs_ack());
        self.pending.push_back(QueuedMessage::new(message, promise));
        self.fill(pool, out)
    }

    /// Reserve the original identifiers of a redelivery batch and place it
    /// ahead of everything queued so far, then reopen admission.
    ///
    /// Entries without a resume stage are plain messages and get a fresh
    /// identifier when admitted. Fails without changing the window if any
    /// identifier is taken.
    pub fn resume(
        &mut self,
        batch: Vec<QueuedMessage>,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), PacketIdError> {
        let mut reserved = Vec::with_capacity(batch.len());
        for queued in batch.iter().filter(|q| q.resume.is_some()) {
            let id = queued.message.packet_id.unwrap_or_default();
            let taken = if self.inflight.contains_key(&id) {
                Err(PacketIdError::Unavailable(id))
            } else {
                pool.take_specific(id)
            };
            if let Err(err) = taken {
                for id in reserved {
                    pool.release(id);
                }
                return Err(err);
            }
            reserved.push(id);
        }

        for queued in batch.into_iter().rev() {
            self.pending.push_front(queued);
        }
        self.held = false;
        self.fill(pool, out)
    }

    /// Admit queued messages while the window has room.
    fn fill(
        &mut self,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), PacketIdError> {
        while !self.held && self.has_capacity() {
            let Some(front) = self.pending.front() else {
                break;
            };
            let packet_id = match front.message.packet_id {
                Some(id) if front.resume.is_some() => id,
                _ => pool.allocate()?,
            };
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            out.push(self.admit(queued, packet_id));
        }
        Ok(())
    }

    fn admit(&mut self, queued: QueuedMessage, packet_id: u16) -> OutboundPacket {
        let QueuedMessage {
            mut message,
            resume,
            promise,
        } = queued;
        message.packet_id = Some(packet_id);
        let stage = resume
            .or_else(|| OutboundStage::initial(message.qos))
            .unwrap_or(OutboundStage::AwaitingPubAck);
        let packet = match (resume, stage) {
            (Some(_), OutboundStage::AwaitingPubComp) => {
                OutboundPacket::PubRel(AckPacket::new(packet_id))
            }
            (Some(_), _) => OutboundPacket::Publish(message.clone().as_duplicate()),
            (None, _) => OutboundPacket::Publish(message.clone()),
        };
        if resume.is_some() {
            message.dup = true;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::trace!(
            packet_id,
            sequence,
            redelivered = resume.is_some(),
            topic = %message.topic,
            "admitted outbound message"
        );
        self.inflight.insert(
            packet_id,
            InflightRecord {
                message,
                stage,
                sequence,
                promise,
            },
        );
        packet
    }

    /// Move a QoS 2 record from PUBREC to PUBCOMP wait.
    ///
    /// Returns false if the identifier is unknown or not awaiting PUBREC.
    pub fn mark_released(&mut self, packet_id: u16) -> bool {
        match self.inflight.get_mut(&packet_id) {
            Some(record) if record.stage == OutboundStage::AwaitingPubRec => {
                record.stage = OutboundStage::AwaitingPubComp;
                true
            }
            _ => false,
        }
    }

    /// Finish the flow for `packet_id`: resolve its status, free the
    /// identifier and admit the head of the queue.
    ///
    /// Returns `Ok(None)` for an identifier that is not admitted; nothing is
    /// released in that case.
    pub fn complete(
        &mut self,
        packet_id: u16,
        status: DeliveryStatus,
        pool: &mut PacketIdPool,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<Option<ApplicationMessage>, PacketIdError> {
        let Some(record) = self.inflight.remove(&packet_id) else {
            return Ok(None);
        };
        pool.release(packet_id);
        let message = record.resolve(status);
        self.fill(pool, out)?;
        Ok(Some(message))
    }

    /// Empty the window for teardown. Promises are left to the caller.
    pub fn drain(&mut self) -> DrainedWindow {
        let mut inflight: Vec<_> = self.inflight.drain().map(|(_, r)| r).collect();
        inflight.sort_by_key(|r| r.sequence);
        DrainedWindow {
            inflight,
            queued: self.pending.drain(..).collect(),
        }
    }
}
