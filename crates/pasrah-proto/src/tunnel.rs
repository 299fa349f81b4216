//! Tunnel configuration records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Transport carried by a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// Plain TCP port forward over the secure channel
    #[default]
    Tcp,
    /// UDP bridged through relays on both ends of a TCP forward
    Udp,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

/// Lifecycle status of a tunnel
///
/// Only `Inactive`, `Active` and `Dead` are ever persisted. `Degraded` is an
/// in-memory signal raised by the monitor when a forward is alive but no
/// longer serving its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Inactive,
    Active,
    Degraded,
    Dead,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
        }
    }

    /// Whether a process topology is expected to exist in this state
    pub fn has_topology(&self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Active => "●",
            Self::Degraded => "◐",
            Self::Dead => "✗",
            Self::Inactive => "○",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation errors for tunnel and server records
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Tunnel name cannot be empty")]
    EmptyName,

    #[error("Identifier must contain only alphanumeric characters, hyphens, and underscores: {0}")]
    InvalidIdentifier(String),

    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Remote host cannot be empty")]
    EmptyHost,

    #[error("Username cannot be empty")]
    EmptyUsername,

    #[error("Unknown tunnel kind: {0} (expected tcp or udp)")]
    UnknownKind(String),

    #[error("Remote server not found: {0}")]
    UnknownServer(String),

    #[error("Local port {port} is already configured for tunnel '{tunnel_id}'")]
    LocalPortTaken { port: u16, tunnel_id: String },

    #[error("Tunnel already exists: {0}")]
    DuplicateTunnel(String),

    #[error("Server already exists: {0}")]
    DuplicateServer(String),

    #[error("Server {server_id} still owns {count} tunnel(s)")]
    ServerInUse { server_id: String, count: usize },
}

/// A configured tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Unique identifier (see [`TunnelConfig::derive_id`])
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Owning server
    pub server_id: String,
    /// Port bound on this host
    pub local_port: u16,
    /// Target host as resolved from the remote server
    #[serde(default = "default_remote_host")]
    pub remote_host: String,
    /// Target port on the remote host
    pub remote_port: u16,
    #[serde(default, rename = "tunnel_type")]
    pub kind: TunnelKind,
    /// Restart the tunnel when the monitor finds it dead
    #[serde(default = "default_true", alias = "auto_start")]
    pub auto_restart: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TunnelStatus,
    /// Primary process id while active
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default = "Utc::now", alias = "created_date")]
    pub created_at: DateTime<Utc>,
}

fn default_remote_host() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

impl TunnelConfig {
    /// Create a new inactive TCP tunnel with an id derived from its name
    pub fn new(
        name: &str,
        server_id: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Self {
        Self {
            id: Self::derive_id(name, local_port),
            name: name.to_string(),
            server_id: server_id.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            kind: TunnelKind::Tcp,
            auto_restart: true,
            description: String::new(),
            status: TunnelStatus::Inactive,
            pid: None,
            created_at: Utc::now(),
        }
    }

    /// Set the tunnel kind
    pub fn with_kind(mut self, kind: TunnelKind) -> Self {
        self.kind = kind;
        self
    }

    /// Enable or disable auto-restart
    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    /// Override the derived id
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Derive a tunnel id from its name and local port: `"{name}_{port}"`,
    /// spaces replaced by underscores, lower-cased.
    pub fn derive_id(name: &str, local_port: u16) -> String {
        format!("{}_{}", name.trim(), local_port)
            .replace(' ', "_")
            .to_lowercase()
    }

    /// `host:port` of the forwarding target
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Check the record's own fields (cross-record checks live in the store)
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        validate_identifier(&self.id)?;
        validate_identifier(&self.server_id)?;
        if self.local_port == 0 || self.remote_port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.remote_host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        Ok(())
    }
}

/// Identifiers double as file-safe keys: alphanumeric, hyphens, underscores
pub fn validate_identifier(id: &str) -> Result<(), ValidationError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}
