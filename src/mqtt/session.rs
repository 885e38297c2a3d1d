//! Per-connection QoS state machine.
//!
//! [`ConnectionState`] owns the outbound window and the inbound duplicate
//! filter of one client connection. It is driven by [`ConnectionEvent`]s,
//! one at a time, from the connection's actor task; nothing here locks
//! except the client's identifier pool, which outlives the connection.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::acks::{AckCorrelator, Correlation};
use super::dedupe::{FlushedAck, InboundDuplicateFilter};
use super::delivery::{DeliveryPromise, DeliveryStatus};
use super::flow_control::{OutboundWindow, QueuedMessage};
use super::metrics::QosMetrics;
use super::packet_id::{PacketIdError, PacketIdRegistry, SharedPacketIdPool};
use super::persistence::{InflightPersistence, RedeliveryEntry};
use super::protocol::{ApplicationMessage, DisconnectReason, InboundPacket, OutboundPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Backend side that receives first-time inbound messages.
pub trait InboundSink: Send + Sync {
    fn on_inbound_delivered(&self, connection_id: ConnectionId, message: ApplicationMessage);
}

/// Session expiry interval in seconds; 0 ends the session on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionExpiry(pub u32);

impl SessionExpiry {
    pub const ON_DISCONNECT: Self = Self(0);

    pub fn persists(self) -> bool {
        self.0 > 0
    }
}

/// What the client negotiated in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub client_id: String,
    /// Client Receive Maximum; `None` when the property was absent.
    pub receive_maximum: Option<u16>,
    pub session_expiry: SessionExpiry,
    /// Clean start was not requested and the broker holds session state.
    pub resume_session: bool,
}

impl ConnectionSettings {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            receive_maximum: None,
            session_expiry: SessionExpiry::ON_DISCONNECT,
            resume_session: false,
        }
    }

    pub fn with_receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.receive_maximum = Some(receive_maximum);
        self
    }

    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry = SessionExpiry(seconds);
        self
    }

    pub fn resuming(mut self) -> Self {
        self.resume_session = true;
        self
    }
}

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct SessionServices {
    pub persistence: Arc<dyn InflightPersistence>,
    pub sink: Arc<dyn InboundSink>,
    pub metrics: Arc<QosMetrics>,
}

/// Input to a connection's serialized event stream.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Packet decoded by the codec.
    Inbound(InboundPacket),
    /// Message from the backend fan-out path.
    Enqueue {
        message: ApplicationMessage,
        promise: DeliveryPromise,
    },
    /// The backend discarded an admitted message.
    MessageDropped { packet_id: u16 },
    /// The codec finished writing a terminal acknowledgment.
    AckWritten { ack: FlushedAck, packet_id: u16 },
    /// Result of the redelivery fetch for a resumed session.
    Redelivery {
        entries: Vec<RedeliveryEntry>,
        unsent: Vec<ApplicationMessage>,
    },
    /// A newer connection for the same client wants the session.
    SessionTakenOver,
    Disconnect,
}

impl ConnectionEvent {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionEvent::Inbound(packet) => packet.label(),
            ConnectionEvent::Enqueue { .. } => "enqueue",
            ConnectionEvent::MessageDropped { .. } => "message_dropped",
            ConnectionEvent::AckWritten { .. } => "ack_written",
            ConnectionEvent::Redelivery { .. } => "redelivery",
            ConnectionEvent::SessionTakenOver => "session_taken_over",
            ConnectionEvent::Disconnect => "disconnect",
        }
    }
}

/// Failures that make the connection's state untrustworthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("packet identifiers exhausted for client {client_id}")]
    IdentifiersExhausted { client_id: String },
    #[error("redelivery identifier {packet_id} already in use for client {client_id}")]
    RedeliveryCollision { client_id: String, packet_id: u16 },
}

impl ConnectionError {
    fn from_pool(client_id: &str, err: PacketIdError) -> Self {
        let client_id = client_id.to_string();
        match err {
            PacketIdError::Exhausted => ConnectionError::IdentifiersExhausted { client_id },
            PacketIdError::Unavailable(packet_id) | PacketIdError::OutOfRange(packet_id) => {
                ConnectionError::RedeliveryCollision {
                    client_id,
                    packet_id,
                }
            }
        }
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ConnectionError::IdentifiersExhausted { .. } => DisconnectReason::ProtocolError,
            ConnectionError::RedeliveryCollision { .. } => {
                DisconnectReason::ImplementationSpecificError
            }
        }
    }
}

/// What teardown did with the connection's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownSummary {
    pub inflight: usize,
    pub queued: usize,
    /// Callers that were waiting on a status and got `NotDelivered`.
    pub notified: usize,
    pub inbound_retained: usize,
    pub session_persisted: bool,
}

pub struct ConnectionState {
    connection_id: ConnectionId,
    client_id: String,
    session_expiry: SessionExpiry,
    window: OutboundWindow,
    inbound: InboundDuplicateFilter,
    pool: SharedPacketIdPool,
    services: SessionServices,
    reported_inflight: usize,
    closed: bool,
}

impl ConnectionState {
    pub fn new(
        connection_id: ConnectionId,
        settings: ConnectionSettings,
        window_size: u16,
        pool: SharedPacketIdPool,
        services: SessionServices,
    ) -> Self {
        let ConnectionSettings {
            client_id,
            session_expiry,
            resume_session,
            ..
        } = settings;
        let persistence = &services.persistence;

        let mut window = OutboundWindow::new(window_size);
        let inbound = if resume_session {
            window.hold();
            match persistence.take_inbound(&client_id) {
                Ok(records) => InboundDuplicateFilter::restore(client_id.clone(), records),
                Err(err) => {
                    tracing::warn!(
                        client_id = %client_id,
                        "discarding unreadable inbound records: {err:#}"
                    );
                    InboundDuplicateFilter::new(client_id.clone())
                }
            }
        } else {
            persistence.discard_session(&client_id);
            InboundDuplicateFilter::new(client_id.clone())
        };
        services.metrics.connections.inc();
        tracing::debug!(
            %connection_id,
            client_id = %client_id,
            window_size = window.window_size(),
            resume_session,
            "connection state created"
        );

        Self {
            connection_id,
            client_id,
            session_expiry,
            window,
            inbound,
            pool,
            services,
            reported_inflight: 0,
            closed: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn window(&self) -> &OutboundWindow {
        &self.window
    }

    pub fn inbound(&self) -> &InboundDuplicateFilter {
        &self.inbound
    }

    pub fn pool(&self) -> &SharedPacketIdPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process one event, appending every packet for the codec to `out`.
    ///
    /// Packets produced before a fatal error are still in `out` and their
    /// in-flight state has been recorded.
    pub fn handle(
        &mut self,
        event: ConnectionEvent,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), ConnectionError> {
        tracing::trace!(
            connection_id = %self.connection_id,
            event = event.label(),
            "handling connection event"
        );
        let start = out.len();
        let result = match event {
            ConnectionEvent::Inbound(packet) => self.on_inbound(packet, out),
            ConnectionEvent::Enqueue { message, promise } => self.enqueue(message, promise, out),
            ConnectionEvent::MessageDropped { packet_id } => self.on_dropped(packet_id, out),
            ConnectionEvent::AckWritten { ack, packet_id } => {
                self.ack_written(ack, packet_id);
                Ok(())
            }
            ConnectionEvent::Redelivery { entries, unsent } => {
                self.on_redelivery(entries, unsent, out)
            }
            ConnectionEvent::SessionTakenOver => {
                tracing::info!(
                    connection_id = %self.connection_id,
                    client_id = %self.client_id,
                    "session taken over by a newer connection"
                );
                out.push(OutboundPacket::Disconnect(DisconnectReason::SessionTakenOver));
                self.closed = true;
                Ok(())
            }
            ConnectionEvent::Disconnect => {
                self.closed = true;
                Ok(())
            }
        };
        self.record_progress(&out[start..]);
        result
    }

    fn on_inbound(
        &mut self,
        packet: InboundPacket,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), ConnectionError> {
        let correlated = match packet {
            InboundPacket::Publish(message) => {
                self.on_inbound_publish(message, out);
                return Ok(());
            }
            InboundPacket::PubRel(ack) => {
                self.inbound.on_pubrel(&ack, out);
                return Ok(());
            }
            InboundPacket::PubAck(ack) => {
                let mut pool = self.pool.lock();
                AckCorrelator::on_puback(&ack, &mut self.window, &mut pool, out)
            }
            InboundPacket::PubRec(ack) => {
                let mut pool = self.pool.lock();
                AckCorrelator::on_pubrec(&ack, &mut self.window, &mut pool, out)
            }
            InboundPacket::PubComp(ack) => {
                let mut pool = self.pool.lock();
                AckCorrelator::on_pubcomp(&ack, &mut self.window, &mut pool, out)
            }
        };
        let correlation =
            correlated.map_err(|err| ConnectionError::from_pool(&self.client_id, err))?;

        match correlation {
            Correlation::Completed {
                packet_id, status, ..
            } => self.finished(packet_id, status),
            Correlation::Released { .. } => {}
            Correlation::Ignored { .. } => self.services.metrics.ack_anomalies.inc(),
        }
        Ok(())
    }

    /// The codec wrote a terminal acknowledgment for an inbound flow.
    pub fn ack_written(&mut self, ack: FlushedAck, packet_id: u16) -> bool {
        self.inbound.on_ack_written(ack, packet_id)
    }

    /// Give unsent messages of a redelivery batch that arrived after close
    /// back to persistence.
    pub fn return_unsent(&self, unsent: Vec<ApplicationMessage>) {
        if !unsent.is_empty() {
            self.services
                .persistence
                .return_unsent(&self.client_id, unsent);
        }
    }

    fn on_inbound_publish(&mut self, message: ApplicationMessage, out: &mut Vec<OutboundPacket>) {
        let suppressed = self.inbound.suppressed_count();
        match self.inbound.on_publish(message, out) {
            Some(message) => {
                self.services.metrics.inbound_forwarded.inc();
                self.services
                    .sink
                    .on_inbound_delivered(self.connection_id, message);
            }
            None if self.inbound.suppressed_count() > suppressed => {
                self.services.metrics.duplicates_suppressed.inc();
            }
            None => self.services.metrics.ack_anomalies.inc(),
        }
    }

    fn enqueue(
        &mut self,
        message: ApplicationMessage,
        promise: DeliveryPromise,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), ConnectionError> {
        if !message.qos.needs_ack() {
            out.push(OutboundPacket::Publish(ApplicationMessage {
                packet_id: None,
                ..message
            }));
            promise.resolve(DeliveryStatus::Delivered);
            self.services.metrics.qos0_passthrough.inc();
            return Ok(());
        }

        let queued_before = self.window.pending_count();
        let result = {
            let mut pool = self.pool.lock();
            self.window.enqueue(message, promise, &mut pool, out)
        };
        if self.window.pending_count() > queued_before {
            self.services.metrics.queued.inc();
        }
        result.map_err(|err| ConnectionError::from_pool(&self.client_id, err))
    }

    fn on_dropped(
        &mut self,
        packet_id: u16,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), ConnectionError> {
        let completed = {
            let mut pool = self.pool.lock();
            self.window
                .complete(packet_id, DeliveryStatus::Dropped, &mut pool, out)
        }
        .map_err(|err| ConnectionError::from_pool(&self.client_id, err))?;

        match completed {
            Some(_) => self.finished(packet_id, DeliveryStatus::Dropped),
            None => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    packet_id,
                    "drop notification for identifier not in flight"
                );
                self.services.metrics.ack_anomalies.inc();
            }
        }
        Ok(())
    }

    fn on_redelivery(
        &mut self,
        entries: Vec<RedeliveryEntry>,
        unsent: Vec<ApplicationMessage>,
        out: &mut Vec<OutboundPacket>,
    ) -> Result<(), ConnectionError> {
        let redelivered = entries.len() as u64;
        let mut batch: Vec<QueuedMessage> = entries
            .into_iter()
            .map(|entry| {
                tracing::trace!(
                    connection_id = %self.connection_id,
                    packet_id = entry.packet_id,
                    stage = ?entry.stage,
                    retry_count = entry.retry_count,
                    "redelivering"
                );
                QueuedMessage::resumed(
                    entry.message.with_packet_id(entry.packet_id),
                    entry.stage,
                    DeliveryPromise::detached(),
                )
            })
            .collect();
        batch.extend(unsent.into_iter().map(|message| {
            QueuedMessage::new(
                ApplicationMessage {
                    packet_id: None,
                    ..message
                },
                DeliveryPromise::detached(),
            )
        }));
        tracing::debug!(
            connection_id = %self.connection_id,
            client_id = %self.client_id,
            redelivered,
            total = batch.len(),
            "resuming session delivery"
        );

        let resumed = {
            let mut pool = self.pool.lock();
            self.window.resume(batch, &mut pool, out)
        };
        resumed.map_err(|err| ConnectionError::from_pool(&self.client_id, err))?;
        self.services.metrics.redelivered.add(redelivered);
        Ok(())
    }

    /// Bookkeeping for a flow that reached a terminal status.
    fn finished(&mut self, packet_id: u16, status: DeliveryStatus) {
        let persistence = &self.services.persistence;
        persistence.clear_in_flight(&self.client_id, packet_id);
        match status {
            DeliveryStatus::Delivered => {
                persistence.notify_delivered(&self.client_id, packet_id);
                self.services.metrics.delivered.inc();
            }
            DeliveryStatus::Dropped => {
                persistence.notify_dropped(&self.client_id, packet_id);
                self.services.metrics.dropped.inc();
            }
            DeliveryStatus::NotDelivered => self.services.metrics.not_delivered.inc(),
        }
    }

    /// Persist every admission and stage change found in `packets`.
    fn record_progress(&mut self, packets: &[OutboundPacket]) {
        for packet in packets {
            let (packet_id, admitted) = match packet {
                OutboundPacket::Publish(message) => match message.packet_id {
                    Some(id) => (id, true),
                    None => continue,
                },
                OutboundPacket::PubRel(ack) => (ack.packet_id, false),
                _ => continue,
            };
            if let Some(record) = self.window.record(packet_id) {
                self.services.persistence.record_in_flight(
                    &self.client_id,
                    packet_id,
                    &record.message,
                    record.stage,
                );
                if admitted {
                    self.services.metrics.admitted.inc();
                }
            }
        }
        self.sync_inflight_gauge();
    }

    fn sync_inflight_gauge(&mut self) {
        let current = self.window.inflight_count();
        let gauge = &self.services.metrics.inflight;
        if current > self.reported_inflight {
            gauge.add((current - self.reported_inflight) as u64);
        } else {
            gauge.sub((self.reported_inflight - current) as u64);
        }
        self.reported_inflight = current;
    }

    /// Release everything this connection holds.
    ///
    /// Every outstanding status resolves `NotDelivered` and every identifier
    /// goes back to the pool. A persistent session keeps its in-flight
    /// records in persistence, gets its never-admitted messages returned
    /// there and hands over its inbound records; otherwise all of it is
    /// discarded together with the client's identifier pool.
    pub fn teardown(&mut self, registry: &PacketIdRegistry) -> TeardownSummary {
        self.closed = true;
        let drained = self.window.drain();
        let persisted = self.session_expiry.persists();
        let mut summary = TeardownSummary {
            inflight: drained.inflight.len(),
            queued: drained.queued.len(),
            notified: 0,
            inbound_retained: 0,
            session_persisted: persisted,
        };

        let mut unsent = Vec::with_capacity(drained.queued.len());
        {
            let mut pool = self.pool.lock();
            for record in drained.inflight {
                pool.release(record.packet_id());
                summary.notified += usize::from(record.is_observed());
                record.resolve(DeliveryStatus::NotDelivered);
            }
            for queued in drained.queued {
                summary.notified += usize::from(queued.is_observed());
                // redelivered but not yet readmitted; persistence still has its record
                if queued.resume.is_some() {
                    if let Some(packet_id) = queued.message.packet_id {
                        pool.release(packet_id);
                    }
                    queued.resolve(DeliveryStatus::NotDelivered);
                } else {
                    unsent.push(queued.resolve(DeliveryStatus::NotDelivered));
                }
            }
        }
        self.services
            .metrics
            .not_delivered
            .add(summary.notified as u64);

        let persistence = &self.services.persistence;
        if persisted {
            persistence.return_unsent(&self.client_id, unsent);
            let records = self.inbound.take_records();
            summary.inbound_retained = records.len();
            if let Err(err) = persistence.store_inbound(&self.client_id, records) {
                tracing::warn!(
                    client_id = %self.client_id,
                    "failed to hand over inbound records: {err:#}"
                );
                summary.inbound_retained = 0;
            }
        } else {
            persistence.discard_session(&self.client_id);
            self.inbound.clear();
            registry.remove_if_current(&self.client_id, &self.pool);
        }

        self.sync_inflight_gauge();
        self.services.metrics.connections.dec();
        tracing::debug!(
            connection_id = %self.connection_id,
            client_id = %self.client_id,
            inflight = summary.inflight,
            queued = summary.queued,
            persisted,
            "connection state torn down"
        );
        summary
    }
}
