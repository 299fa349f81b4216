//! Engine timing and port-window configuration

use pasrah_proto::Settings;
use std::ops::Range;
use std::time::Duration;

/// Runtime configuration of the tunnel engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address secure forwards bind their local port to
    pub bind_address: String,
    /// Delay between monitoring passes
    pub monitor_interval: Duration,
    /// Sleep after a monitoring pass that failed unexpectedly
    pub error_backoff: Duration,
    /// Record bandwidth samples during monitoring passes
    pub bandwidth_enabled: bool,
    pub bandwidth_flush_interval: Duration,
    /// Pause between teardown and re-creation on restart
    pub restart_delay: Duration,
    /// Timeout of the server reachability probe
    pub reachability_timeout: Duration,
    pub forward_ready_timeout: Duration,
    pub relay_ready_timeout: Duration,
    /// How long a process group gets between SIGTERM and SIGKILL
    pub terminate_grace: Duration,
    /// Time a remote relay gets to crash before it is considered started
    pub remote_relay_settle: Duration,
    /// Candidate ports for the intermediate remote relay port
    pub remote_port_range: Range<u16>,
    /// Offsets from the tunnel's local port searched for a UDP chain's TCP leg
    pub local_relay_offset: Range<u16>,
    /// Timeout of each remote probe command
    pub remote_probe_timeout: Duration,
    pub remote_install_timeout: Duration,
    /// Timeout of connectivity and latency probes
    pub connectivity_timeout: Duration,
    /// Number of stderr lines kept per supervised process
    pub stderr_tail_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            monitor_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(30),
            bandwidth_enabled: true,
            bandwidth_flush_interval: Duration::from_secs(60),
            restart_delay: Duration::from_secs(1),
            reachability_timeout: Duration::from_secs(10),
            forward_ready_timeout: Duration::from_secs(10),
            relay_ready_timeout: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(5),
            remote_relay_settle: Duration::from_secs(1),
            remote_port_range: 10000..20000,
            local_relay_offset: 1000..2000,
            remote_probe_timeout: Duration::from_secs(10),
            remote_install_timeout: Duration::from_secs(300),
            connectivity_timeout: Duration::from_secs(5),
            stderr_tail_lines: 20,
        }
    }
}

impl EngineConfig {
    /// Apply the operator settings on top of the defaults
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_address: settings.bind_address.clone(),
            monitor_interval: Duration::from_secs(settings.tunnel_check_interval.max(1)),
            bandwidth_enabled: settings.enable_bandwidth_monitoring,
            ..Self::default()
        }
    }

    /// Window searched for the TCP leg of a UDP chain bound on `local_port`
    ///
    /// Clamped to the top of the port space; empty when `local_port` is too
    /// close to it.
    pub fn local_relay_window(&self, local_port: u16) -> Range<u16> {
        let start = local_port.saturating_add(self.local_relay_offset.start);
        let end = local_port.saturating_add(self.local_relay_offset.end);
        start..end
    }
}
