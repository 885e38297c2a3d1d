//! QoS engine counters.
//!
//! Shared by every connection actor through an `Arc<QosMetrics>`; all
//! updates are relaxed atomics so the hot path never takes a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Counter / Gauge
// ---------------------------------------------------------------------------

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Level that moves both ways; never wraps below zero.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(value))
            });
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Engine metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct QosMetrics {
    /// Messages given a packet identifier and handed to the codec.
    pub admitted: Counter,
    /// Messages that had to wait for window space.
    pub queued: Counter,
    pub delivered: Counter,
    pub dropped: Counter,
    pub not_delivered: Counter,
    pub qos0_passthrough: Counter,
    pub inbound_forwarded: Counter,
    pub duplicates_suppressed: Counter,
    pub ack_anomalies: Counter,
    pub redelivered: Counter,
    pub fatal_disconnects: Counter,
    pub inflight: Gauge,
    pub connections: Gauge,
}

impl QosMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export as name -> value.
    pub fn export(&self) -> HashMap<String, f64> {
        let counters = [
            ("qos_outbound_admitted_total", &self.admitted),
            ("qos_outbound_queued_total", &self.queued),
            ("qos_outbound_delivered_total", &self.delivered),
            ("qos_outbound_dropped_total", &self.dropped),
            ("qos_outbound_not_delivered_total", &self.not_delivered),
            ("qos_outbound_qos0_total", &self.qos0_passthrough),
            ("qos_inbound_forwarded_total", &self.inbound_forwarded),
            ("qos_inbound_duplicates_total", &self.duplicates_suppressed),
            ("qos_ack_anomalies_total", &self.ack_anomalies),
            ("qos_redelivered_total", &self.redelivered),
            ("qos_fatal_disconnects_total", &self.fatal_disconnects),
        ];
        let mut metrics: HashMap<String, f64> = counters
            .into_iter()
            .map(|(name, counter)| (name.to_string(), counter.get() as f64))
            .collect();
        metrics.insert("qos_inflight".into(), self.inflight.get() as f64);
        metrics.insert("qos_connections".into(), self.connections.get() as f64);
        metrics
    }
}
