//! Status reports returned to callers

use chrono::{DateTime, Utc};
use pasrah_proto::{TunnelKind, TunnelStatus};
use serde::Serialize;
use std::time::Duration;

/// Point-in-time status of one tunnel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub id: String,
    pub status: TunnelStatus,
    pub kind: Option<TunnelKind>,
    pub local_port: Option<u16>,
    /// Primary pid (the secure forward)
    pub pid: Option<u32>,
    /// Members of the topology as `role:pid`
    pub processes: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "uptime_secs", serialize_with = "serialize_uptime")]
    pub uptime: Option<Duration>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Why a registered tunnel is not active
    pub detail: Option<String>,
}

fn serialize_uptime<S: serde::Serializer>(
    uptime: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match uptime {
        Some(d) => serializer.serialize_some(&d.as_secs()),
        None => serializer.serialize_none(),
    }
}

impl StatusReport {
    /// Report for a tunnel with no registered topology
    pub fn inactive(id: &str) -> Self {
        Self::unregistered(id, TunnelStatus::Inactive)
    }

    pub fn unregistered(id: &str, status: TunnelStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
            kind: None,
            local_port: None,
            pid: None,
            processes: Vec::new(),
            started_at: None,
            uptime: None,
            bytes_in: 0,
            bytes_out: 0,
            detail: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TunnelStatus::Active
    }

    /// Human readable uptime, e.g. `2h 5m 12s`
    pub fn uptime_display(&self) -> String {
        let Some(uptime) = self.uptime else {
            return "-".to_string();
        };
        let secs = uptime.as_secs();
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if h > 0 {
            format!("{}h {}m {}s", h, m, s)
        } else if m > 0 {
            format!("{}m {}s", m, s)
        } else {
            format!("{}s", s)
        }
    }
}

/// Result of a connectivity or latency probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub id: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    /// Bytes recorded for the tunnel over the last hour
    pub bytes_last_hour: u64,
}

/// Counts shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub servers: usize,
    pub tunnels: usize,
    pub active: usize,
}
