//! Tunnel event log and bandwidth records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a tunnel log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connect,
    Disconnect,
    Reconnect,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reconnect => "reconnect",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the tunnel event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub tunnel_id: String,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TunnelEvent {
    pub fn new(kind: EventKind, tunnel_id: &str, message: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Traffic counters flushed by the monitor for one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub tunnel_id: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    #[serde(rename = "duration")]
    pub duration_secs: u64,
    pub timestamp: DateTime<Utc>,
}

impl BandwidthSample {
    pub fn total(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}
