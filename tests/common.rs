//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building an engine over in-memory persistence
//! - Recording what reaches the backend
//! - Reading packets a connection hands to its codec

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use parking_lot::Mutex;
use quantum_qos::mqtt::persistence::MemoryPersistence;
use quantum_qos::mqtt::protocol::{AckPacket, ApplicationMessage, InboundPacket, OutboundPacket, PayloadRef, Qos};
use quantum_qos::mqtt::session::{ConnectionEvent, ConnectionId, InboundSink};
use quantum_qos::{Connection, EngineConfig, QosEngine};
use std::sync::Arc;
use std::time::Duration;

/// Backend stand-in that remembers every forwarded inbound message.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(ConnectionId, ApplicationMessage)>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn topics(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|(_, m)| m.topic.clone())
            .collect()
    }
}

impl InboundSink for RecordingSink {
    fn on_inbound_delivered(&self, connection_id: ConnectionId, message: ApplicationMessage) {
        self.delivered.lock().push((connection_id, message));
    }
}

pub struct TestEngine {
    pub engine: QosEngine,
    pub store: Arc<MemoryPersistence>,
    pub sink: Arc<RecordingSink>,
}

/// Engine with the given broker window cap.
pub fn engine_with_window(max_inflight_window: u16) -> TestEngine {
    let store = Arc::new(MemoryPersistence::new());
    let sink = Arc::new(RecordingSink::default());
    let config = EngineConfig {
        max_inflight_window,
        registry_shards: 8,
        ..EngineConfig::default()
    };
    let engine = QosEngine::new(config, store.clone(), sink.clone()).expect("valid config");
    TestEngine {
        engine,
        store,
        sink,
    }
}

pub fn msg(topic: &str, qos: Qos) -> ApplicationMessage {
    ApplicationMessage::new(topic, PayloadRef(topic.len() as u64), qos)
}

/// Next packet for the codec; panics if none arrives within a second.
pub async fn next_packet(conn: &mut Connection) -> OutboundPacket {
    tokio::time::timeout(Duration::from_secs(1), conn.outbound.recv())
        .await
        .expect("packet within timeout")
        .expect("connection still open")
}

/// `(topic, packet id, dup)` of a PUBLISH; panics on anything else.
pub fn publish_parts(packet: &OutboundPacket) -> (String, Option<u16>, bool) {
    match packet {
        OutboundPacket::Publish(m) => (m.topic.clone(), m.packet_id, m.dup),
        other => panic!("expected publish, got {other:?}"),
    }
}

pub async fn send(conn: &Connection, packet: InboundPacket) {
    conn.handle
        .submit(ConnectionEvent::Inbound(packet))
        .await
        .expect("connection accepts events");
}

pub async fn puback(conn: &Connection, packet_id: u16) {
    send(conn, InboundPacket::PubAck(AckPacket::new(packet_id))).await;
}

/// Push a QoS 0 marker through the connection and assert it is the very
/// next packet, proving nothing else was emitted before it.
pub async fn assert_quiet(conn: &mut Connection) {
    let fence = conn.handle.enqueue(msg("fence", Qos::AtMostOnce));
    let packet = next_packet(conn).await;
    assert_eq!(publish_parts(&packet), ("fence".to_string(), None, false));
    drop(fence);
}
