//! In-process store used by tests and embedders that manage their own persistence

use chrono::{DateTime, Utc};
use pasrah_proto::{
    BandwidthSample, EventKind, ServerConfig, Settings, TunnelConfig, TunnelEvent, TunnelStatus,
};
use std::sync::{Mutex, MutexGuard};

use crate::{ConfigDocument, StoreError, TunnelStore};

#[derive(Default)]
struct Inner {
    document: ConfigDocument,
    events: Vec<TunnelEvent>,
    bandwidth: Vec<BandwidthSample>,
}

/// Store that keeps everything in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing document
    pub fn with_document(document: ConfigDocument) -> Self {
        Self {
            inner: Mutex::new(Inner {
                document,
                ..Inner::default()
            }),
        }
    }

    /// Replace the settings
    pub fn set_settings(&self, settings: Settings) {
        self.lock().document.settings = settings;
    }

    /// Snapshot of the whole document
    pub fn document(&self) -> ConfigDocument {
        self.lock().document.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TunnelStore for MemoryStore {
    fn get_tunnel(&self, id: &str) -> Result<Option<TunnelConfig>, StoreError> {
        Ok(self.lock().document.tunnels.get(id).cloned())
    }

    fn get_server(&self, id: &str) -> Result<Option<ServerConfig>, StoreError> {
        Ok(self.lock().document.servers.get(id).cloned())
    }

    fn list_tunnels(&self) -> Result<Vec<TunnelConfig>, StoreError> {
        Ok(self.lock().document.tunnels.values().cloned().collect())
    }

    fn list_servers(&self) -> Result<Vec<ServerConfig>, StoreError> {
        Ok(self.lock().document.servers.values().cloned().collect())
    }

    fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<(), StoreError> {
        self.lock().document.add_tunnel(tunnel)
    }

    fn remove_tunnel(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock().document.remove_tunnel(id))
    }

    fn add_server(&self, server: ServerConfig) -> Result<(), StoreError> {
        self.lock().document.add_server(server)
    }

    fn remove_server(&self, id: &str) -> Result<bool, StoreError> {
        self.lock().document.remove_server(id)
    }

    fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.lock().document.set_auto_restart(id, enabled)
    }

    fn set_tunnel_status(
        &self,
        id: &str,
        status: TunnelStatus,
        pid: Option<u32>,
    ) -> Result<(), StoreError> {
        self.lock().document.set_tunnel_status(id, status, pid)
    }

    fn record_event(
        &self,
        kind: EventKind,
        tunnel_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.lock()
            .events
            .push(TunnelEvent::new(kind, tunnel_id, message));
        Ok(())
    }

    fn record_bandwidth(
        &self,
        tunnel_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        duration_secs: u64,
    ) -> Result<(), StoreError> {
        self.lock().bandwidth.push(BandwidthSample {
            tunnel_id: tunnel_id.to_string(),
            bytes_in,
            bytes_out,
            duration_secs,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn events(
        &self,
        tunnel_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TunnelEvent>, StoreError> {
        Ok(self
            .lock()
            .events
            .iter()
            .rev()
            .filter(|e| tunnel_id.map_or(true, |id| e.tunnel_id == id))
            .take(limit)
            .cloned()
            .collect())
    }

    fn bandwidth_since(
        &self,
        tunnel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BandwidthSample>, StoreError> {
        Ok(self
            .lock()
            .bandwidth
            .iter()
            .filter(|s| s.tunnel_id == tunnel_id && s.timestamp >= since)
            .cloned()
            .collect())
    }

    fn settings(&self) -> Result<Settings, StoreError> {
        Ok(self.lock().document.settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_events() {
        let store = MemoryStore::new();
        store
            .add_server(ServerConfig::new("s1", "example.com", "root"))
            .unwrap();
        store
            .add_tunnel(TunnelConfig::new("web", "s1", 8080, "localhost", 80))
            .unwrap();

        store
            .record_event(EventKind::Connect, "web_8080", "up")
            .unwrap();
        store
            .record_event(EventKind::Reconnect, "web_8080", "restarted")
            .unwrap();

        let events = store.events(None, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Reconnect);
        assert_eq!(store.document().tunnels.len(), 1);
    }
}
