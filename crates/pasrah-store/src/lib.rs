//! Persistence for tunnel and server records
//!
//! The tunnel engine reads configuration and writes status, events and
//! bandwidth samples through the [`TunnelStore`] trait. [`FileStore`] keeps
//! everything under `~/.pasrah/`; [`MemoryStore`] keeps it in process.

pub mod document;
pub mod file;
pub mod memory;

pub use document::ConfigDocument;
pub use file::FileStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use pasrah_proto::{
    BandwidthSample, EventKind, ServerConfig, Settings, TunnelConfig, TunnelEvent, TunnelStatus,
    ValidationError,
};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Home directory could not be determined")]
    NoHomeDir,
}

/// Durable tunnel/server records and the event log
///
/// Status writes are reserved for the tunnel lifecycle manager; every other
/// caller treats `status` and `pid` as read-only.
pub trait TunnelStore: Send + Sync {
    fn get_tunnel(&self, id: &str) -> Result<Option<TunnelConfig>, StoreError>;

    fn get_server(&self, id: &str) -> Result<Option<ServerConfig>, StoreError>;

    fn list_tunnels(&self) -> Result<Vec<TunnelConfig>, StoreError>;

    fn list_servers(&self) -> Result<Vec<ServerConfig>, StoreError>;

    /// Persist a new tunnel (validated against the existing records)
    fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<(), StoreError>;

    /// Delete a tunnel record; returns whether it existed
    fn remove_tunnel(&self, id: &str) -> Result<bool, StoreError>;

    fn add_server(&self, server: ServerConfig) -> Result<(), StoreError>;

    /// Delete a server that owns no tunnels; returns whether it existed
    fn remove_server(&self, id: &str) -> Result<bool, StoreError>;

    fn set_auto_restart(&self, id: &str, enabled: bool) -> Result<(), StoreError>;

    fn set_tunnel_status(
        &self,
        id: &str,
        status: TunnelStatus,
        pid: Option<u32>,
    ) -> Result<(), StoreError>;

    fn record_event(&self, kind: EventKind, tunnel_id: &str, message: &str)
        -> Result<(), StoreError>;

    fn record_bandwidth(
        &self,
        tunnel_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        duration_secs: u64,
    ) -> Result<(), StoreError>;

    /// Most recent events first, optionally filtered by tunnel
    fn events(&self, tunnel_id: Option<&str>, limit: usize)
        -> Result<Vec<TunnelEvent>, StoreError>;

    fn bandwidth_since(
        &self,
        tunnel_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BandwidthSample>, StoreError>;

    fn settings(&self) -> Result<Settings, StoreError>;
}
