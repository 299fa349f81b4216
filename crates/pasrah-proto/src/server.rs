//! Remote server records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::tunnel::{validate_identifier, ValidationError};
use crate::DEFAULT_SSH_PORT;

/// A remote machine reachable over SSH
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Private key used for this server; falls back to the global key
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default = "Utc::now", alias = "added_date")]
    pub added_at: DateTime<Utc>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl ServerConfig {
    pub fn new(id: &str, host: &str, username: &str) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port: DEFAULT_SSH_PORT,
            username: username.to_string(),
            identity_file: None,
            added_at: Utc::now(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// `user@host` destination for the SSH client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// `host:port` of the SSH endpoint
    pub fn ssh_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier(&self.id)?;
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        if self.username.trim().is_empty() {
            return Err(ValidationError::EmptyUsername);
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}
