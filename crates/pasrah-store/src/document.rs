//! The configuration document shared by both store implementations

use pasrah_proto::{ServerConfig, Settings, TunnelConfig, TunnelStatus, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::StoreError;

/// Current document format version
pub const DOCUMENT_VERSION: &str = "1.0.0";

/// Servers, tunnels and settings as persisted in `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelConfig>,
    #[serde(default)]
    pub settings: Settings,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: default_version(),
            servers: BTreeMap::new(),
            tunnels: BTreeMap::new(),
            settings: Settings::default(),
        }
    }
}

impl ConfigDocument {
    /// Insert a tunnel after checking it against the rest of the document
    pub fn add_tunnel(&mut self, mut tunnel: TunnelConfig) -> Result<(), StoreError> {
        tunnel.validate()?;

        if self.tunnels.contains_key(&tunnel.id) {
            return Err(ValidationError::DuplicateTunnel(tunnel.id).into());
        }
        if !self.servers.contains_key(&tunnel.server_id) {
            return Err(ValidationError::UnknownServer(tunnel.server_id).into());
        }
        if let Some(other) = self
            .tunnels
            .values()
            .find(|t| t.local_port == tunnel.local_port)
        {
            return Err(ValidationError::LocalPortTaken {
                port: tunnel.local_port,
                tunnel_id: other.id.clone(),
            }
            .into());
        }

        // New records always start out inactive
        tunnel.status = TunnelStatus::Inactive;
        tunnel.pid = None;
        self.tunnels.insert(tunnel.id.clone(), tunnel);
        Ok(())
    }

    pub fn remove_tunnel(&mut self, id: &str) -> bool {
        self.tunnels.remove(id).is_some()
    }

    pub fn add_server(&mut self, server: ServerConfig) -> Result<(), StoreError> {
        server.validate()?;
        if self.servers.contains_key(&server.id) {
            return Err(ValidationError::DuplicateServer(server.id).into());
        }
        self.servers.insert(server.id.clone(), server);
        Ok(())
    }

    pub fn remove_server(&mut self, id: &str) -> Result<bool, StoreError> {
        let count = self.tunnels.values().filter(|t| t.server_id == id).count();
        if count > 0 {
            return Err(ValidationError::ServerInUse {
                server_id: id.to_string(),
                count,
            }
            .into());
        }
        Ok(self.servers.remove(id).is_some())
    }

    pub fn set_tunnel_status(
        &mut self,
        id: &str,
        status: TunnelStatus,
        pid: Option<u32>,
    ) -> Result<(), StoreError> {
        let tunnel = self
            .tunnels
            .get_mut(id)
            .ok_or_else(|| StoreError::TunnelNotFound(id.to_string()))?;
        tunnel.status = status;
        tunnel.pid = pid;
        Ok(())
    }

    pub fn set_auto_restart(&mut self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let tunnel = self
            .tunnels
            .get_mut(id)
            .ok_or_else(|| StoreError::TunnelNotFound(id.to_string()))?;
        tunnel.auto_restart = enabled;
        Ok(())
    }
}
