//! Engine settings persisted alongside the configuration document

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Operator-tunable settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds between monitoring passes
    pub tunnel_check_interval: u64,
    /// Seconds allowed for SSH connection establishment
    pub ssh_timeout: u64,
    /// Address local tunnel ports bind to
    pub bind_address: String,
    /// Record periodic bandwidth samples for active tunnels
    pub enable_bandwidth_monitoring: bool,
    /// Default private key for servers without their own identity file
    pub private_key_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tunnel_check_interval: 60,
            ssh_timeout: 30,
            bind_address: "0.0.0.0".to_string(),
            enable_bandwidth_monitoring: true,
            private_key_path: None,
        }
    }
}
