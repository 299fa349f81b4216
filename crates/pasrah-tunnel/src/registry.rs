//! Registry of active tunnels
//!
//! Each tunnel id owns one slot guarded by its own async mutex. Every
//! lifecycle operation and every monitor check on an id runs with that
//! slot locked, so two topologies can never be live for the same id. An
//! empty slot is dropped once its last user lets go of it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pasrah_proto::TunnelConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::topology::Topology;

/// Monitor bookkeeping for one active tunnel; never persisted
#[derive(Debug, Clone)]
pub struct MonitorRecord {
    pub last_checked: Option<Instant>,
    pub consecutive_failures: u32,
    /// Traffic counted since the last flush
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Counters written by the last flush
    pub flushed_in: u64,
    pub flushed_out: u64,
    pub last_flush: Instant,
}

impl MonitorRecord {
    pub fn new() -> Self {
        Self {
            last_checked: None,
            consecutive_failures: 0,
            bytes_in: 0,
            bytes_out: 0,
            flushed_in: 0,
            flushed_out: 0,
            last_flush: Instant::now(),
        }
    }

    /// Move pending counters into the flushed ones; returns
    /// `(bytes_in, bytes_out, seconds covered)`
    pub fn flush(&mut self) -> (u64, u64, u64) {
        let covered = self.last_flush.elapsed().as_secs();
        self.flushed_in = std::mem::take(&mut self.bytes_in);
        self.flushed_out = std::mem::take(&mut self.bytes_out);
        self.last_flush = Instant::now();
        (self.flushed_in, self.flushed_out, covered)
    }
}

impl Default for MonitorRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered tunnel and the processes implementing it
#[derive(Debug)]
pub struct ActiveTunnel {
    pub config: TunnelConfig,
    pub topology: Topology,
    pub monitor: MonitorRecord,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

impl ActiveTunnel {
    pub fn new(config: TunnelConfig, topology: Topology) -> Self {
        Self {
            config,
            topology,
            monitor: MonitorRecord::new(),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        }
    }
}

/// Slot holding the active tunnel for one id, if any
pub type TunnelSlot = Arc<Mutex<Option<ActiveTunnel>>>;

#[derive(Default)]
pub struct TunnelRegistry {
    slots: DashMap<String, TunnelSlot>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for `id`, created empty on first use
    pub fn slot(&self, id: &str) -> TunnelSlot {
        self.slots.entry(id.to_string()).or_default().clone()
    }

    /// The slot for `id` if one exists
    pub fn existing(&self, id: &str) -> Option<TunnelSlot> {
        self.slots.get(id).map(|slot| slot.clone())
    }

    /// Ids that currently have a slot, sorted; check the slot for membership
    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Drop the slot for `id` when it holds no topology and no caller has a
    /// handle to it; returns whether it was dropped
    ///
    /// The count is checked under the map's shard lock, so no new handle can
    /// be taken out while the slot is removed.
    pub fn release(&self, id: &str) -> bool {
        self.slots
            .remove_if(id, |_, slot| {
                Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|guard| guard.is_none())
            })
            .is_some()
    }

    /// Ids currently holding a topology
    pub async fn active_ids(&self) -> Vec<String> {
        let mut active = Vec::new();
        for id in self.known_ids() {
            if self.slot(&id).lock().await.is_some() {
                active.push(id);
            }
        }
        active
    }

    pub async fn is_active(&self, id: &str) -> bool {
        match self.existing(id) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }
}
