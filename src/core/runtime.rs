use crate::config::EngineConfig;
use crate::mqtt::delivery::{DeliveryPromise, DeliveryStatus, DeliveryStatusFuture};
use crate::mqtt::metrics::QosMetrics;
use crate::mqtt::packet_id::PacketIdRegistry;
use crate::mqtt::persistence::InflightPersistence;
use crate::mqtt::protocol::{ApplicationMessage, OutboundPacket};
use crate::mqtt::session::{
    ConnectionEvent, ConnectionId, ConnectionSettings, ConnectionState, InboundSink,
    SessionServices, TeardownSummary,
};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
}

/// Live connections, by connection and by client identifier.
#[derive(Debug, Default)]
struct ConnectionTable {
    by_id: HashMap<ConnectionId, ConnectionHandle>,
    by_client: HashMap<Arc<str>, ConnectionId>,
}

type ConnectionMap = Arc<RwLock<ConnectionTable>>;

/// Sending side of a connection's serialized event stream.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    client_id: Arc<str>,
    events: mpsc::Sender<ConnectionEvent>,
    closed: watch::Receiver<bool>,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // a dropped sender means the actor is gone as well
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Queue an event, waiting for room in the event stream.
    pub async fn submit(&self, event: ConnectionEvent) -> Result<(), EngineError> {
        self.events
            .send(event)
            .await
            .map_err(|_| EngineError::ConnectionClosed(self.connection_id))
    }

    /// Hand a message to the connection without waiting.
    ///
    /// A full event stream reports `Dropped`; a closed one `NotDelivered`.
    pub fn enqueue(&self, message: ApplicationMessage) -> DeliveryStatusFuture {
        let (promise, future) = DeliveryPromise::new();
        match self
            .events
            .try_send(ConnectionEvent::Enqueue { message, promise })
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ConnectionEvent::Enqueue { promise, .. })) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "event stream full; dropping outbound message"
                );
                promise.resolve(DeliveryStatus::Dropped);
            }
            // the promise inside the returned event resolves NotDelivered when dropped
            Err(_) => {}
        }
        future
    }

    pub async fn disconnect(&self) -> Result<(), EngineError> {
        self.submit(ConnectionEvent::Disconnect).await
    }
}

/// A live connection as seen by its codec.
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnectionHandle,
    /// Packets to serialize, in wire order.
    pub outbound: mpsc::Receiver<OutboundPacket>,
    pub task: JoinHandle<TeardownSummary>,
}

/// Broker-wide entry point: owns the identifier registry and routes
/// backend traffic to connection actors.
pub struct QosEngine {
    config: EngineConfig,
    registry: Arc<PacketIdRegistry>,
    services: SessionServices,
    connections: ConnectionMap,
    next_connection: AtomicU64,
}

impl QosEngine {
    pub fn new(
        config: EngineConfig,
        persistence: Arc<dyn InflightPersistence>,
        sink: Arc<dyn InboundSink>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(PacketIdRegistry::new(config.registry_shards));
        Ok(Self {
            config,
            registry,
            services: SessionServices {
                persistence,
                sink,
                metrics: Arc::new(QosMetrics::new()),
            },
            connections: Arc::new(RwLock::new(ConnectionTable::default())),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<QosMetrics> {
        &self.services.metrics
    }

    pub fn registry(&self) -> &Arc<PacketIdRegistry> {
        &self.registry
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().by_id.get(&connection_id).cloned()
    }

    /// The live connection currently owning a client's session.
    pub fn client_connection(&self, client_id: &str) -> Option<ConnectionHandle> {
        let table = self.connections.read();
        let connection_id = table.by_client.get(client_id)?;
        table.by_id.get(connection_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().by_id.len()
    }

    /// Start the actor for a newly accepted connection.
    ///
    /// Must be called within a Tokio runtime. If the client still has a live
    /// connection, that one is sent DISCONNECT (Session Taken Over) and this
    /// connection builds its state only after the old one is torn down. A
    /// resumed session holds new traffic until its redelivery batch has been
    /// fetched and placed.
    pub fn connect(&self, settings: ConnectionSettings) -> Connection {
        let connection_id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let client_id: Arc<str> = Arc::from(settings.client_id.as_str());
        let window_size = self.config.window_size(settings.receive_maximum);
        let resume = settings.resume_session;

        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_channel_capacity);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = ConnectionHandle {
            connection_id,
            client_id: Arc::clone(&client_id),
            events: events_tx.clone(),
            closed: closed_rx,
        };
        let predecessor = {
            let mut table = self.connections.write();
            table.by_id.insert(connection_id, handle.clone());
            table
                .by_client
                .insert(Arc::clone(&client_id), connection_id)
                .and_then(|previous| table.by_id.get(&previous).cloned())
        };

        let startup = Startup {
            settings,
            window_size,
            predecessor,
            events_tx,
            events_rx,
            outbound: outbound_tx,
            closed: closed_tx,
            registry: Arc::clone(&self.registry),
            connections: Arc::clone(&self.connections),
            services: self.services.clone(),
        };
        let task = tokio::spawn(startup.run(connection_id));
        tracing::info!(
            %connection_id,
            client_id = %client_id,
            window_size,
            resume,
            "connection registered"
        );
        Connection {
            handle,
            outbound: outbound_rx,
            task,
        }
    }

    /// Backend fan-out entry point. Unknown connections resolve
    /// `NotDelivered` immediately.
    pub fn enqueue_outbound(
        &self,
        connection_id: ConnectionId,
        message: ApplicationMessage,
    ) -> DeliveryStatusFuture {
        match self.connection(connection_id) {
            Some(handle) => handle.enqueue(message),
            None => {
                tracing::debug!(%connection_id, "enqueue for unknown connection");
                self.services.metrics.not_delivered.inc();
                DeliveryStatusFuture::resolved(DeliveryStatus::NotDelivered)
            }
        }
    }

    /// Notify a connection that the backend discarded one of its messages.
    pub async fn message_dropped(
        &self,
        connection_id: ConnectionId,
        packet_id: u16,
    ) -> Result<(), EngineError> {
        self.connection(connection_id)
            .ok_or(EngineError::UnknownConnection(connection_id))?
            .submit(ConnectionEvent::MessageDropped { packet_id })
            .await
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), EngineError> {
        self.connection(connection_id)
            .ok_or(EngineError::UnknownConnection(connection_id))?
            .disconnect()
            .await
    }
}

/// Everything a connection needs before its state can exist.
struct Startup {
    settings: ConnectionSettings,
    window_size: u16,
    predecessor: Option<ConnectionHandle>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: mpsc::Receiver<ConnectionEvent>,
    outbound: mpsc::Sender<OutboundPacket>,
    closed: watch::Sender<bool>,
    registry: Arc<PacketIdRegistry>,
    connections: ConnectionMap,
    services: SessionServices,
}

impl Startup {
    async fn run(self, connection_id: ConnectionId) -> TeardownSummary {
        let Startup {
            settings,
            window_size,
            predecessor,
            events_tx,
            events_rx,
            outbound,
            closed,
            registry,
            connections,
            services,
        } = self;

        if let Some(previous) = predecessor {
            let previous_id = previous.connection_id();
            tracing::info!(
                %connection_id,
                %previous_id,
                client_id = %previous.client_id(),
                "taking over session from live connection"
            );
            if let Err(err) = previous.submit(ConnectionEvent::SessionTakenOver).await {
                tracing::debug!(%connection_id, "{err}; waiting for its teardown");
            }
            previous.closed().await;
        }

        let resume = settings.resume_session;
        let pool = registry.for_client(&settings.client_id);
        let client_id: Arc<str> = Arc::from(settings.client_id.as_str());
        let state = ConnectionState::new(
            connection_id,
            settings,
            window_size,
            pool,
            services.clone(),
        );
        let fetch = resume.then(|| {
            tokio::spawn(fetch_redelivery(
                connection_id,
                client_id,
                Arc::clone(&services.persistence),
                events_tx,
            ))
        });

        let actor = ConnectionActor {
            state,
            events: events_rx,
            outbound,
            fetch,
            closed,
            registry,
            connections,
            metrics: Arc::clone(&services.metrics),
        };
        actor.run().await
    }
}

/// Load the redelivery batch of a resumed session and hand it to the actor.
async fn fetch_redelivery(
    connection_id: ConnectionId,
    client_id: Arc<str>,
    persistence: Arc<dyn InflightPersistence>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let entries = match persistence.fetch_pending_redelivery(&client_id).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(
                %connection_id,
                client_id = %client_id,
                "redelivery fetch failed; resuming without it: {err:#}"
            );
            Vec::new()
        }
    };
    let unsent = persistence.take_unsent(&client_id);
    let event = ConnectionEvent::Redelivery { entries, unsent };
    if let Err(mpsc::error::SendError(event)) = events.send(event).await {
        tracing::debug!(%connection_id, "connection closed before redelivery");
        if let ConnectionEvent::Redelivery { unsent, .. } = event {
            persistence.return_unsent(&client_id, unsent);
        }
    }
}

struct ConnectionActor {
    state: ConnectionState,
    events: mpsc::Receiver<ConnectionEvent>,
    outbound: mpsc::Sender<OutboundPacket>,
    fetch: Option<JoinHandle<()>>,
    closed: watch::Sender<bool>,
    registry: Arc<PacketIdRegistry>,
    connections: ConnectionMap,
    metrics: Arc<QosMetrics>,
}

impl ConnectionActor {
    async fn run(mut self) -> TeardownSummary {
        let connection_id = self.state.connection_id();
        let mut out = Vec::new();
        while let Some(event) = self.events.recv().await {
            let result = self.state.handle(event, &mut out);
            let mut codec_gone = false;
            for packet in out.drain(..) {
                if self.outbound.send(packet).await.is_err() {
                    codec_gone = true;
                    break;
                }
            }
            if let Err(err) = result {
                tracing::warn!(
                    %connection_id,
                    client_id = %self.state.client_id(),
                    reason = err.disconnect_reason().code(),
                    "closing connection: {err}"
                );
                self.metrics.fatal_disconnects.inc();
                if self
                    .outbound
                    .send(OutboundPacket::Disconnect(err.disconnect_reason()))
                    .await
                    .is_err()
                {
                    tracing::debug!(%connection_id, "codec gone before fatal disconnect");
                }
                break;
            }
            if codec_gone {
                tracing::debug!(%connection_id, "codec went away");
                break;
            }
            if self.state.is_closed() {
                break;
            }
        }
        self.shutdown().await
    }

    /// Settle whatever is still queued, tear down, then unregister.
    ///
    /// Confirmed acknowledgment writes still complete their inbound flows so
    /// the handed-over records are accurate; new messages fail fast.
    async fn shutdown(mut self) -> TeardownSummary {
        let connection_id = self.state.connection_id();
        self.events.close();
        if let Some(fetch) = self.fetch.take() {
            if let Err(err) = fetch.await {
                tracing::warn!(%connection_id, "redelivery fetch task failed: {err}");
            }
        }

        let mut failed = 0u64;
        while let Ok(event) = self.events.try_recv() {
            match event {
                ConnectionEvent::Enqueue { promise, .. } => {
                    promise.resolve(DeliveryStatus::NotDelivered);
                    failed += 1;
                }
                ConnectionEvent::AckWritten { ack, packet_id } => {
                    self.state.ack_written(ack, packet_id);
                }
                ConnectionEvent::Redelivery { unsent, .. } => self.state.return_unsent(unsent),
                other => tracing::trace!(
                    %connection_id,
                    event = other.label(),
                    "discarding event after close"
                ),
            }
        }
        if failed > 0 {
            self.metrics.not_delivered.add(failed);
            tracing::debug!(%connection_id, failed, "fast-failed queued messages");
        }

        let summary = self.state.teardown(&self.registry);
        {
            let mut table = self.connections.write();
            table.by_id.remove(&connection_id);
            let client_id = self.state.client_id();
            if table.by_client.get(client_id) == Some(&connection_id) {
                table.by_client.remove(client_id);
            }
        }
        self.closed.send_replace(true);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::persistence::NoopPersistence;
    use crate::mqtt::protocol::{PayloadRef, Qos};

    struct NullSink;

    impl InboundSink for NullSink {
        fn on_inbound_delivered(&self, _connection_id: ConnectionId, _message: ApplicationMessage) {}
    }

    fn engine(config: EngineConfig) -> QosEngine {
        QosEngine::new(config, Arc::new(NoopPersistence), Arc::new(NullSink)).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let config = EngineConfig {
            max_inflight_window: 0,
            ..EngineConfig::default()
        };
        assert!(QosEngine::new(config, Arc::new(NoopPersistence), Arc::new(NullSink)).is_err());
    }

    #[tokio::test]
    async fn unknown_connection_is_not_delivered() {
        let engine = engine(EngineConfig::default());
        let status = engine
            .enqueue_outbound(
                ConnectionId(99),
                ApplicationMessage::new("t", PayloadRef(1), Qos::AtLeastOnce),
            )
            .await;
        assert_eq!(status, DeliveryStatus::NotDelivered);
        assert_eq!(
            engine.message_dropped(ConnectionId(99), 1).await,
            Err(EngineError::UnknownConnection(ConnectionId(99)))
        );
    }

    #[tokio::test]
    async fn disconnect_unregisters_and_fails_pending() {
        let engine = engine(EngineConfig {
            max_inflight_window: 1,
            ..EngineConfig::default()
        });
        let mut conn = engine.connect(ConnectionSettings::new("c1"));
        let id = conn.handle.connection_id();
        assert_eq!(engine.connection_count(), 1);

        let first = engine.enqueue_outbound(id, ApplicationMessage::new("a", PayloadRef(1), Qos::AtLeastOnce));
        let second = engine.enqueue_outbound(id, ApplicationMessage::new("b", PayloadRef(2), Qos::AtLeastOnce));
        assert!(matches!(conn.outbound.recv().await, Some(OutboundPacket::Publish(_))));

        engine.disconnect(id).await.unwrap();
        let summary = conn.task.await.unwrap();
        assert_eq!(summary.inflight, 1);
        assert_eq!(summary.queued, 1);
        assert_eq!(first.await, DeliveryStatus::NotDelivered);
        assert_eq!(second.await, DeliveryStatus::NotDelivered);
        assert_eq!(engine.connection_count(), 0);
        assert!(engine.registry().get("c1").is_none());
    }
}
