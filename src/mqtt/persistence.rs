//! Persistence boundary for crash-recoverable in-flight state.
//!
//! The engine reports every admitted message and every stage change through
//! [`InflightPersistence`], asks for redelivery candidates once when a
//! session resumes, and hands unsent messages and inbound records back at
//! teardown. Notifications are fire-and-forget; only the redelivery fetch is
//! asynchronous and its result re-enters the connection as an event.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::dedupe::InboundDeliveryRecord;
use super::flow_control::OutboundStage;
use super::protocol::ApplicationMessage;

pub type PersistenceFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// A previously admitted, unacknowledged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryEntry {
    pub packet_id: u16,
    pub message: ApplicationMessage,
    pub stage: OutboundStage,
    /// Redelivery attempts made so far, this one included.
    pub retry_count: u32,
}

pub trait InflightPersistence: Send + Sync {
    /// Record (or update the stage of) an admitted message.
    fn record_in_flight(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &ApplicationMessage,
        stage: OutboundStage,
    );

    fn clear_in_flight(&self, client_id: &str, packet_id: u16);

    /// Unacknowledged messages in their original delivery order.
    fn fetch_pending_redelivery<'a>(
        &'a self,
        client_id: &'a str,
    ) -> PersistenceFuture<'a, Vec<RedeliveryEntry>>;

    fn notify_delivered(&self, client_id: &str, packet_id: u16);

    fn notify_dropped(&self, client_id: &str, packet_id: u16);

    /// Take back messages that were queued but never admitted.
    fn return_unsent(&self, client_id: &str, messages: Vec<ApplicationMessage>);

    /// Unsent messages returned by an earlier connection, oldest first.
    fn take_unsent(&self, client_id: &str) -> Vec<ApplicationMessage>;

    /// Forget everything stored for a session that did not persist.
    fn discard_session(&self, client_id: &str);

    fn store_inbound(
        &self,
        client_id: &str,
        records: Vec<InboundDeliveryRecord>,
    ) -> anyhow::Result<()>;

    fn take_inbound(&self, client_id: &str) -> anyhow::Result<Vec<InboundDeliveryRecord>>;
}

/// Envelope for inbound records with schema metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub schema_version: u16,
    pub payload: Vec<u8>,
}

impl InboundEnvelope {
    pub const CURRENT_SCHEMA_VERSION: u16 = 1;

    pub fn encode(records: &[InboundDeliveryRecord]) -> anyhow::Result<Self> {
        let payload = bincode::serialize(records)
            .map_err(|e| anyhow::anyhow!("failed to encode inbound records: {}", e))?;
        Ok(Self {
            schema_version: Self::CURRENT_SCHEMA_VERSION,
            payload,
        })
    }

    pub fn decode(&self) -> anyhow::Result<Vec<InboundDeliveryRecord>> {
        if self.schema_version != Self::CURRENT_SCHEMA_VERSION {
            anyhow::bail!(
                "unsupported inbound record schema version {}",
                self.schema_version
            );
        }
        bincode::deserialize(&self.payload)
            .map_err(|e| anyhow::anyhow!("failed to decode inbound records: {}", e))
    }
}

#[derive(Debug, Clone)]
struct StoredInflight {
    message: ApplicationMessage,
    stage: OutboundStage,
    retry_count: u32,
    order: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    inflight: HashMap<String, HashMap<u16, StoredInflight>>,
    unsent: HashMap<String, Vec<ApplicationMessage>>,
    inbound: HashMap<String, InboundEnvelope>,
    delivered: Vec<(String, u16)>,
    dropped: Vec<(String, u16)>,
    next_order: u64,
}

/// In-process store, used by tests and single-node setups.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifiers recorded in flight for a client, in delivery order.
    pub fn inflight_ids(&self, client_id: &str) -> Vec<u16> {
        let state = self.state.lock();
        let Some(records) = state.inflight.get(client_id) else {
            return Vec::new();
        };
        let mut ids: Vec<_> = records.iter().map(|(id, r)| (r.order, *id)).collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn stage(&self, client_id: &str, packet_id: u16) -> Option<OutboundStage> {
        self.state
            .lock()
            .inflight
            .get(client_id)
            .and_then(|r| r.get(&packet_id))
            .map(|r| r.stage)
    }

    pub fn unsent_count(&self, client_id: &str) -> usize {
        self.state.lock().unsent.get(client_id).map_or(0, Vec::len)
    }

    pub fn has_inbound(&self, client_id: &str) -> bool {
        self.state.lock().inbound.contains_key(client_id)
    }

    pub fn delivered(&self) -> Vec<(String, u16)> {
        self.state.lock().delivered.clone()
    }

    pub fn dropped(&self) -> Vec<(String, u16)> {
        self.state.lock().dropped.clone()
    }
}

impl InflightPersistence for MemoryPersistence {
    fn record_in_flight(
        &self,
        client_id: &str,
        packet_id: u16,
        message: &ApplicationMessage,
        stage: OutboundStage,
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let order = state.next_order;
        let records = state.inflight.entry(client_id.to_string()).or_default();
        match records.get_mut(&packet_id) {
            Some(existing) => {
                existing.stage = stage;
                existing.message = message.clone();
            }
            None => {
                records.insert(
                    packet_id,
                    StoredInflight {
                        message: message.clone(),
                        stage,
                        retry_count: 0,
                        order,
                    },
                );
                state.next_order += 1;
            }
        }
    }

    fn clear_in_flight(&self, client_id: &str, packet_id: u16) {
        let mut state = self.state.lock();
        if let Some(records) = state.inflight.get_mut(client_id) {
            records.remove(&packet_id);
            if records.is_empty() {
                state.inflight.remove(client_id);
            }
        }
    }

    fn fetch_pending_redelivery<'a>(
        &'a self,
        client_id: &'a str,
    ) -> PersistenceFuture<'a, Vec<RedeliveryEntry>> {
        let mut entries: Vec<_> = {
            let mut state = self.state.lock();
            let pending = state
                .inflight
                .get_mut(client_id)
                .map(|records| {
                    records
                        .iter_mut()
                        .map(|(id, stored)| {
                            stored.retry_count += 1;
                            (
                                stored.order,
                                RedeliveryEntry {
                                    packet_id: *id,
                                    message: stored.message.clone(),
                                    stage: stored.stage,
                                    retry_count: stored.retry_count,
                                },
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            pending
        };
        entries.sort_by_key(|(order, _)| *order);
        let entries: Vec<RedeliveryEntry> = entries.into_iter().map(|(_, entry)| entry).collect();
        Box::pin(async move { Ok(entries) })
    }

    fn notify_delivered(&self, client_id: &str, packet_id: u16) {
        self.state
            .lock()
            .delivered
            .push((client_id.to_string(), packet_id));
    }

    fn notify_dropped(&self, client_id: &str, packet_id: u16) {
        self.state
            .lock()
            .dropped
            .push((client_id.to_string(), packet_id));
    }

    fn return_unsent(&self, client_id: &str, messages: Vec<ApplicationMessage>) {
        if messages.is_empty() {
            return;
        }
        self.state
            .lock()
            .unsent
            .entry(client_id.to_string())
            .or_default()
            .extend(messages);
    }

    fn take_unsent(&self, client_id: &str) -> Vec<ApplicationMessage> {
        self.state.lock().unsent.remove(client_id).unwrap_or_default()
    }

    fn discard_session(&self, client_id: &str) {
        let mut state = self.state.lock();
        state.inflight.remove(client_id);
        state.unsent.remove(client_id);
        state.inbound.remove(client_id);
    }

    fn store_inbound(
        &self,
        client_id: &str,
        records: Vec<InboundDeliveryRecord>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if records.is_empty() {
            state.inbound.remove(client_id);
            return Ok(());
        }
        let envelope = InboundEnvelope::encode(&records)?;
        state.inbound.insert(client_id.to_string(), envelope);
        Ok(())
    }

    fn take_inbound(&self, client_id: &str) -> anyhow::Result<Vec<InboundDeliveryRecord>> {
        match self.state.lock().inbound.remove(client_id) {
            Some(envelope) => envelope.decode(),
            None => Ok(Vec::new()),
        }
    }
}

/// Persistence that keeps nothing; sessions never resume anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

impl InflightPersistence for NoopPersistence {
    fn record_in_flight(
        &self,
        _client_id: &str,
        _packet_id: u16,
        _message: &ApplicationMessage,
        _stage: OutboundStage,
    ) {
    }

    fn clear_in_flight(&self, _client_id: &str, _packet_id: u16) {}

    fn fetch_pending_redelivery<'a>(
        &'a self,
        _client_id: &'a str,
    ) -> PersistenceFuture<'a, Vec<RedeliveryEntry>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn notify_delivered(&self, _client_id: &str, _packet_id: u16) {}

    fn notify_dropped(&self, _client_id: &str, _packet_id: u16) {}

    fn return_unsent(&self, _client_id: &str, _messages: Vec<ApplicationMessage>) {}

    fn take_unsent(&self, _client_id: &str) -> Vec<ApplicationMessage> {
        Vec::new()
    }

    fn discard_session(&self, _client_id: &str) {}

    fn store_inbound(
        &self,
        _client_id: &str,
        _records: Vec<InboundDeliveryRecord>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn take_inbound(&self, _client_id: &str) -> anyhow::Result<Vec<InboundDeliveryRecord>> {
        Ok(Vec::new())
    }
}
