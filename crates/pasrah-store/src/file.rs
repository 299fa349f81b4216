//! File-backed store
//!
//! Keeps the configuration document in `~/.pasrah/config.json` and
//! appends events and bandwidth samples as JSON lines next to it.

use chrono::{DateTime, Utc};
use pasrah_proto::{
    BandwidthSample, EventKind, ServerConfig, Settings, TunnelConfig, TunnelEvent, TunnelStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use crate::{ConfigDocument, StoreError, TunnelStore};

const CONFIG_FILE: &str = "config.json";
const EVENTS_FILE: &str = "events.jsonl";
const BANDWIDTH_FILE: &str = "bandwidth.jsonl";

/// Store rooted at a data directory
pub struct FileStore {
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles on the config document
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store in the default location (`~/.pasrah`)
    pub fn new() -> Result<Self, StoreError> {
        Self::with_base_dir(Self::default_base_dir()?)
    }

    /// Open the store in a custom directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Default data directory
    pub fn default_base_dir() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::NoHomeDir)?;
        Ok(home.join(".pasrah"))
    }

    /// Get the base directory path (for display purposes)
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    /// Load the document, falling back to defaults when the file is missing
    pub fn load(&self) -> Result<ConfigDocument, StoreError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(ConfigDocument::default());
        }

        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, document: &ConfigDocument) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(document)?;

        // Write to a sibling file first so a crash never leaves a torn document
        let tmp = self.base_dir.join(format!("{}.tmp", CONFIG_FILE));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.config_path())?;
        Ok(())
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut ConfigDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut document = self.load()?;
        let result = f(&mut document)?;
        self.save(&document)?;
        Ok(result)
    }

    /// Replace the persisted settings
    pub fn save_settings(&self, settings: Settings) -> Result<(), StoreError> {
        self.update(|doc| {
            doc.settings = settings;
            Ok(())
        })
    }

    fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base_dir.join(file))?;
        out.write_all(line.as_bytes())?;
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, StoreError> {
        let path = self.base_dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable line in {:?}: {}", path, e),
            }
        }
        Ok(records)
    }
}

impl TunnelStore for FileStore {
    fn get_tunnel(&self, id: &str) -> Result<Option<TunnelConfig>, StoreError> {
        Ok(self.load()?.tunnels.get(id).cloned())
    }

    fn get_server(&self, id: &str) -> Result<Option<ServerConfig>, StoreError> {
        Ok(self.load()?.servers.get(id).cloned())
    }

    fn list_tunnels(&self) -> Result<Vec<TunnelConfig>, StoreError> {
        Ok(self.load()?.tunnels.into_values().collect())
    }

    fn list_servers(&self) -> Result<Vec<ServerConfig>, StoreError> {
        Ok(self.load()?.servers.into_values().collect())
    }

    fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<(), StoreError> {
        self.update(|doc| doc.add_tunnel(tunnel))
    }

    fn remove_tunnel(&self, id: &str) -> Result<bool, StoreError> {
        self.update(|doc| Ok(doc.remove_tunnel(id)))
    }

    fn add_server(&self, server: ServerConfig) -> Result<(), StoreError> {
        self.update(|doc| doc.add_server(server))
    }

    fn remove_server(&self, id: &str) -> Result<bool, StoreError> {
        self.update(|doc| doc.remove_server(id))
    }

    fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.update(|doc| doc.set_auto_restart(id, enabled))
    }

    fn set_tunnel_status(
        &self,
        id: &str,
        status: TunnelStatus,
        pid: Option<u32>,
    ) -> Result<(), StoreError> {
        self.update(|doc| doc.set_tunnel_status(id, status, pid))
    }

    fn record_event(
        &self,
        kind: EventKind,
        tunnel_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.append_line(EVENTS_FILE, &TunnelEvent::new(kind, tunnel_id, message))
    }

    fn record_bandwidth(
        &self,
        tunnel_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        duration_secs: u64,
    ) -> Result<(), StoreError> {
        let sample = BandwidthSample {
            tunnel_id: tunnel_id.to_string(),
            bytes_in,
            bytes_out,
            duration_secs,
            timestamp: Utc::now(),
        };
        self.append_line(BANDWIDTH_FILE, &sample)
    }

    fn events(
        &self,
        tunnel_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TunnelEvent>, StoreError> {
        let events: Vec<TunnelEvent> = self.read_lines(EVENTS_FILE)?;
        Ok(events
            .into_iter()
            .rev()
            .filter(|e| tunnel_id.map_or(true, |id| e.tunnel_id == id))
            .take(limit)
            .collect())
    }

    fn bandwidth_since(
        &self,
        tunnel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BandwidthSample>, StoreError> {
        let samples: Vec<BandwidthSample> = self.read_lines(BANDWIDTH_FILE)?;
        Ok(samples
            .into_iter()
            .filter(|s| s.tunnel_id == tunnel_id && s.timestamp >= since)
            .collect())
    }

    fn settings(&self) -> Result<Settings, StoreError> {
        Ok(self.load()?.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pasrah_proto::TunnelKind;
    use tempfile::TempDir;

    fn create_test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::with_base_dir(temp_dir.path()).unwrap();
        store
            .add_server(ServerConfig::new("server1", "example.com", "root"))
            .unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_empty_store_has_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::with_base_dir(temp_dir.path()).unwrap();

        assert!(store.list_tunnels().unwrap().is_empty());
        assert_eq!(store.settings().unwrap(), Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let (store, _temp) = create_test_store();
        let tunnel = TunnelConfig::new("game", "server1", 27015, "localhost", 27015)
            .with_kind(TunnelKind::Udp);

        store.add_tunnel(tunnel).unwrap();

        let loaded = store.get_tunnel("game_27015").unwrap().unwrap();
        assert_eq!(loaded.kind, TunnelKind::Udp);
        assert_eq!(loaded.status, TunnelStatus::Inactive);

        // A second handle on the same directory sees the same records
        let reopened = FileStore::with_base_dir(store.base_dir()).unwrap();
        assert!(reopened.get_tunnel("game_27015").unwrap().is_some());
    }

    #[test]
    fn test_list_sorted_by_id() {
        let (store, _temp) = create_test_store();
        store
            .add_tunnel(TunnelConfig::new("web", "server1", 8080, "localhost", 80))
            .unwrap();
        store
            .add_tunnel(TunnelConfig::new("api", "server1", 8081, "localhost", 81))
            .unwrap();

        let tunnels = store.list_tunnels().unwrap();
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].id, "api_8081");
        assert_eq!(tunnels[1].id, "web_8080");
    }

    #[test]
    fn test_status_roundtrip_through_disk() {
        let (store, _temp) = create_test_store();
        store
            .add_tunnel(TunnelConfig::new("web", "server1", 8080, "localhost", 80))
            .unwrap();

        store
            .set_tunnel_status("web_8080", TunnelStatus::Active, Some(4321))
            .unwrap();
        let loaded = store.get_tunnel("web_8080").unwrap().unwrap();
        assert_eq!(loaded.status, TunnelStatus::Active);
        assert_eq!(loaded.pid, Some(4321));

        assert!(matches!(
            store.set_tunnel_status("missing", TunnelStatus::Active, None),
            Err(StoreError::TunnelNotFound(_))
        ));
    }

    #[test]
    fn test_events_most_recent_first() {
        let (store, _temp) = create_test_store();

        store
            .record_event(EventKind::Connect, "web_8080", "created")
            .unwrap();
        store
            .record_event(EventKind::Connect, "api_8081", "created")
            .unwrap();
        store
            .record_event(EventKind::Disconnect, "web_8080", "destroyed")
            .unwrap();

        let events = store.events(Some("web_8080"), 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Disconnect);
        assert_eq!(events[1].kind, EventKind::Connect);

        assert_eq!(store.events(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_bandwidth_window() {
        let (store, _temp) = create_test_store();
        store.record_bandwidth("web_8080", 10, 20, 60).unwrap();
        store.record_bandwidth("api_8081", 1, 1, 60).unwrap();

        let hour_ago = Utc::now() - Duration::hours(1);
        let samples = store.bandwidth_since("web_8080", hour_ago).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].total(), 30);

        let future = Utc::now() + Duration::hours(1);
        assert!(store.bandwidth_since("web_8080", future).unwrap().is_empty());
    }

    #[test]
    fn test_settings_persist() {
        let (store, _temp) = create_test_store();
        let settings = Settings {
            tunnel_check_interval: 5,
            ..Settings::default()
        };
        store.save_settings(settings.clone()).unwrap();
        assert_eq!(store.settings().unwrap(), settings);

        // Saving settings keeps the rest of the document intact
        assert!(store.get_server("server1").unwrap().is_some());
    }
}
