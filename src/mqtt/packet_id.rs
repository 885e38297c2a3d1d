//! Packet identifier allocation.
//!
//! Each client session owns one [`PacketIdPool`]; the broker-wide
//! [`PacketIdRegistry`] hands out the pool for a client identifier and keeps
//! it alive across reconnects until the session is destroyed.
//!
//! The pool tracks the *free* identifiers as an ordered list of half-open
//! ranges. Allocation takes the lowest free identifier, so a fresh pool
//! counts up from 1 and a released identifier is reused before higher ones.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;
use thiserror::Error;
use twox_hash::XxHash64;

use super::protocol::{MAX_PACKET_ID, MIN_PACKET_ID};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketIdError {
    /// Every identifier in `[1, 65535]` is in flight.
    #[error("packet identifier pool exhausted")]
    Exhausted,
    /// The requested identifier is already in flight.
    #[error("packet identifier {0} already in use")]
    Unavailable(u16),
    #[error("packet identifier {0} outside the valid range")]
    OutOfRange(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    start: u32,
    end: u32,
}

/// Free-list of packet identifiers for one client.
#[derive(Debug, Clone)]
pub struct PacketIdPool {
    /// Disjoint, ascending, non-adjacent free ranges.
    free: Vec<FreeRange>,
    in_flight: usize,
}

impl Default for PacketIdPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdPool {
    pub fn new() -> Self {
        Self {
            free: vec![FreeRange {
                start: u32::from(MIN_PACKET_ID),
                end: u32::from(MAX_PACKET_ID) + 1,
            }],
            in_flight: 0,
        }
    }

    /// Take the lowest free identifier.
    pub fn allocate(&mut self) -> Result<u16, PacketIdError> {
        let first = self.free.first_mut().ok_or(PacketIdError::Exhausted)?;
        let id = first.start;
        first.start += 1;
        if first.start == first.end {
            self.free.remove(0);
        }
        self.in_flight += 1;
        Ok(id as u16)
    }

    /// Reserve a specific identifier, used when resuming a redelivery.
    pub fn take_specific(&mut self, id: u16) -> Result<(), PacketIdError> {
        if id < MIN_PACKET_ID {
            return Err(PacketIdError::OutOfRange(id));
        }
        let id = u32::from(id);
        let idx = self.free.partition_point(|r| r.end <= id);
        let Some(range) = self.free.get_mut(idx) else {
            return Err(PacketIdError::Unavailable(id as u16));
        };
        if range.start > id {
            return Err(PacketIdError::Unavailable(id as u16));
        }

        if range.start == id {
            range.start += 1;
            if range.start == range.end {
                self.free.remove(idx);
            }
        } else if range.end == id + 1 {
            range.end = id;
        } else {
            let upper = FreeRange {
                start: id + 1,
                end: range.end,
            };
            range.end = id;
            self.free.insert(idx + 1, upper);
        }
        self.in_flight += 1;
        Ok(())
    }

    /// Return an identifier to the pool. Returns false if it was already free.
    pub fn release(&mut self, id: u16) -> bool {
        if id < MIN_PACKET_ID {
            tracing::warn!("ignoring release of packet identifier {id}");
            return false;
        }
        let id = u32::from(id);
        let idx = self.free.partition_point(|r| r.end < id);

        if let Some(range) = self.free.get(idx) {
            if range.start <= id && id < range.end {
                return false;
            }
        }

        match self.free.get(idx).copied() {
            Some(range) if range.end == id => {
                self.free[idx].end += 1;
                if let Some(next) = self.free.get(idx + 1).copied() {
                    if next.start == self.free[idx].end {
                        self.free[idx].end = next.end;
                        self.free.remove(idx + 1);
                    }
                }
            }
            Some(range) if range.start == id + 1 => {
                self.free[idx].start = id;
            }
            _ => self.free.insert(
                idx,
                FreeRange {
                    start: id,
                    end: id + 1,
                },
            ),
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        true
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        if id < MIN_PACKET_ID {
            return false;
        }
        let id = u32::from(id);
        let idx = self.free.partition_point(|r| r.end <= id);
        !matches!(self.free.get(idx), Some(range) if range.start <= id)
    }

    /// Number of identifiers currently handed out.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// Pool shared between a client's successive connections.
pub type SharedPacketIdPool = Arc<Mutex<PacketIdPool>>;

/// Broker-wide client identifier → pool map, striped to keep unrelated
/// clients from contending.
pub struct PacketIdRegistry {
    shards: Vec<RwLock<HashMap<String, SharedPacketIdPool>>>,
}

impl Default for PacketIdRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PacketIdRegistry {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, client_id: &str) -> &RwLock<HashMap<String, SharedPacketIdPool>> {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(client_id.as_bytes());
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Get the pool for a client, creating it on first use.
    ///
    /// Concurrent callers for the same client always observe the same pool.
    pub fn for_client(&self, client_id: &str) -> SharedPacketIdPool {
        let shard = self.shard(client_id);
        if let Some(pool) = shard.read().get(client_id) {
            return Arc::clone(pool);
        }
        let mut guard = shard.write();
        Arc::clone(
            guard
                .entry(client_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PacketIdPool::new()))),
        )
    }

    pub fn get(&self, client_id: &str) -> Option<SharedPacketIdPool> {
        self.shard(client_id).read().get(client_id).cloned()
    }

    /// Drop the pool when the client's session ends.
    pub fn remove(&self, client_id: &str) -> Option<SharedPacketIdPool> {
        let removed = self.shard(client_id).write().remove(client_id);
        if removed.is_some() {
            tracing::trace!("removed packet identifier pool for client {client_id}");
        }
        removed
    }

    /// Drop the client's pool only if it is still `pool`; a newer connection
    /// may already have replaced it.
    pub fn remove_if_current(&self, client_id: &str, pool: &SharedPacketIdPool) -> bool {
        let mut guard = self.shard(client_id).write();
        match guard.get(client_id) {
            Some(current) if Arc::ptr_eq(current, pool) => {
                guard.remove(client_id);
                tracing::trace!("removed packet identifier pool for client {client_id}");
                true
            }
            _ => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}
