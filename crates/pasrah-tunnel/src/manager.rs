//! Tunnel lifecycle manager
//!
//! Creates, destroys and restarts the process topologies behind configured
//! tunnels. The manager is the only writer of a tunnel's persisted status;
//! every transition happens with the tunnel's registry slot locked.

use chrono::Utc;
use pasrah_proto::{EventKind, ServerConfig, TunnelConfig, TunnelKind, TunnelStatus};
use pasrah_remote::{RemoteExecutor, RemoteSession};
use pasrah_store::TunnelStore;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::commands::{ensure_remote_tooling, TopologyCommands};
use crate::monitor::MonitorHandle;
use crate::ports::{
    find_local_port, find_remote_port, is_port_in_use, is_udp_port_free, probe_reachable,
};
use crate::process::{ProcessSupervisor, ReadyProbe, RemoteRelay};
use crate::registry::{ActiveTunnel, TunnelRegistry};
use crate::status::{EngineStats, LatencyReport, StatusReport};
use crate::topology::{Topology, UdpChain};
use crate::{EngineConfig, TunnelError};

/// Loopback address the TCP leg of a UDP chain binds to
const CHAIN_BIND_ADDRESS: &str = "127.0.0.1";
const UDP_PROBE_PAYLOAD: &[u8] = b"pasrah-probe";
const UDP_REFUSAL_WAIT: Duration = Duration::from_millis(200);

/// Lifecycle manager for all tunnels known to a store
pub struct TunnelManager {
    pub(crate) store: Arc<dyn TunnelStore>,
    executor: Arc<dyn RemoteExecutor>,
    commands: Arc<dyn TopologyCommands>,
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) registry: TunnelRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) monitor: Mutex<Option<MonitorHandle>>,
}

impl TunnelManager {
    pub fn new(
        store: Arc<dyn TunnelStore>,
        executor: Arc<dyn RemoteExecutor>,
        commands: Arc<dyn TopologyCommands>,
        config: EngineConfig,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(config.terminate_grace, config.stderr_tail_lines);
        Self {
            store,
            executor,
            commands,
            supervisor,
            registry: TunnelRegistry::new(),
            config,
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TunnelStore> {
        &self.store
    }

    /// Ids currently holding a registry slot, active or not
    pub fn tracked_ids(&self) -> Vec<String> {
        self.registry.known_ids()
    }

    /// Build and register the topology for `id`
    pub async fn create(&self, id: &str) -> Result<String, TunnelError> {
        let slot = self.registry.slot(id);
        let result = self.create_locked(id, &mut *slot.lock().await).await;
        drop(slot);
        self.registry.release(id);
        result
    }

    /// Tear down the topology for `id` and mark it inactive
    pub async fn destroy(&self, id: &str) -> Result<String, TunnelError> {
        let Some(slot) = self.registry.existing(id) else {
            return Err(TunnelError::NotActive(id.to_string()));
        };
        let stopped = self.destroy_locked(id, &mut *slot.lock().await).await;
        drop(slot);
        self.registry.release(id);

        if stopped {
            Ok(format!("Tunnel {} stopped", id))
        } else {
            Err(TunnelError::NotActive(id.to_string()))
        }
    }

    /// Destroy (if active), wait for the port to be released, create again
    pub async fn restart(&self, id: &str) -> Result<String, TunnelError> {
        let slot = self.registry.slot(id);
        let result = {
            let mut guard = slot.lock().await;
            if self.destroy_locked(id, &mut guard).await {
                tokio::time::sleep(self.config.restart_delay).await;
            }
            self.create_locked(id, &mut guard).await
        };
        drop(slot);
        self.registry.release(id);
        result
    }

    /// Live status of `id`; unregistered tunnels are inactive
    pub async fn get_status(&self, id: &str) -> StatusReport {
        let Some(slot) = self.registry.existing(id) else {
            return StatusReport::inactive(id);
        };
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(active) => Self::report(active).await,
            None => StatusReport::inactive(id),
        }
    }

    /// Status of every registered tunnel
    pub async fn list_active(&self) -> BTreeMap<String, StatusReport> {
        let mut reports = BTreeMap::new();
        for id in self.registry.known_ids() {
            let Some(slot) = self.registry.existing(&id) else {
                continue;
            };
            let mut guard = slot.lock().await;
            if let Some(active) = guard.as_mut() {
                reports.insert(id, Self::report(active).await);
            }
        }
        reports
    }

    /// Status of every configured tunnel, registered or not
    pub async fn list_all(&self) -> Result<BTreeMap<String, StatusReport>, TunnelError> {
        let mut reports = self.list_active().await;
        for tunnel in self.store.list_tunnels()? {
            if reports.contains_key(&tunnel.id) {
                continue;
            }
            // A persisted Active without a topology is left over from a crash
            let status = match tunnel.status {
                TunnelStatus::Dead => TunnelStatus::Dead,
                _ => TunnelStatus::Inactive,
            };
            let mut report = StatusReport::unregistered(&tunnel.id, status);
            report.kind = Some(tunnel.kind);
            report.local_port = Some(tunnel.local_port);
            reports.insert(tunnel.id.clone(), report);
        }
        Ok(reports)
    }

    /// Persist a new tunnel and start it right away when auto-restart is on
    ///
    /// A start failure is reported in the message; the record stays.
    pub async fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<String, TunnelError> {
        let id = tunnel.id.clone();
        let start = tunnel.auto_restart;
        self.store.add_tunnel(tunnel)?;
        info!("[{}] Tunnel added", id);

        if !start {
            return Ok(format!("Tunnel {} added", id));
        }

        match self.create(&id).await {
            Ok(message) => Ok(format!("Tunnel {} added. {}", id, message)),
            Err(e) => {
                warn!("[{}] Added but failed to start: {}", id, e);
                Ok(format!("Tunnel {} added but failed to start: {}", id, e))
            }
        }
    }

    /// Stop the tunnel if needed and delete its record
    pub async fn remove_tunnel(&self, id: &str) -> Result<String, TunnelError> {
        if self.store.get_tunnel(id)?.is_none() {
            return Err(TunnelError::ConfigNotFound(id.to_string()));
        }

        let slot = self.registry.slot(id);
        let removed = {
            let mut guard = slot.lock().await;
            self.destroy_locked(id, &mut guard).await;
            self.store.remove_tunnel(id)
        };
        drop(slot);
        self.registry.release(id);
        removed?;

        info!("[{}] Tunnel removed", id);
        Ok(format!("Tunnel {} removed", id))
    }

    /// Stop an active tunnel, start an inactive one
    pub async fn toggle(&self, id: &str) -> Result<String, TunnelError> {
        let slot = self.registry.slot(id);
        let result = {
            let mut guard = slot.lock().await;
            if self.destroy_locked(id, &mut guard).await {
                Ok(format!("Tunnel {} stopped", id))
            } else {
                self.create_locked(id, &mut guard).await
            }
        };
        drop(slot);
        self.registry.release(id);
        result
    }

    /// Whether the tunnel's local port answers
    pub async fn test_connectivity(&self, id: &str) -> Result<bool, TunnelError> {
        let tunnel = self.tunnel(id)?;
        Ok(self.probe_local(&tunnel).await.is_some())
    }

    /// Round-trip time of a local probe plus the last hour of recorded traffic
    pub async fn measure_latency(&self, id: &str) -> Result<LatencyReport, TunnelError> {
        let tunnel = self.tunnel(id)?;
        let latency = self.probe_local(&tunnel).await;

        let since = Utc::now() - chrono::Duration::hours(1);
        let bytes_last_hour = self
            .store
            .bandwidth_since(id, since)?
            .iter()
            .map(|sample| sample.total())
            .sum();

        Ok(LatencyReport {
            id: id.to_string(),
            reachable: latency.is_some(),
            latency_ms: latency.map(|d| d.as_secs_f64() * 1000.0),
            bytes_last_hour,
        })
    }

    /// Create every tunnel with auto-restart enabled; returns how many started
    pub async fn start_enabled(&self) -> Result<usize, TunnelError> {
        let enabled: Vec<TunnelConfig> = self
            .store
            .list_tunnels()?
            .into_iter()
            .filter(|t| t.auto_restart)
            .collect();
        info!("Found {} enabled tunnel(s)", enabled.len());

        let mut started = 0;
        for tunnel in enabled {
            match self.create(&tunnel.id).await {
                Ok(_) => started += 1,
                Err(TunnelError::AlreadyActive(_)) => {}
                Err(e) => error!("[{}] Failed to start tunnel: {}", tunnel.id, e),
            }
        }
        Ok(started)
    }

    /// Stop the monitor, then every registered tunnel
    pub async fn shutdown(&self) {
        info!("Shutting down tunnel manager...");
        self.stop_monitor().await;

        for id in self.registry.active_ids().await {
            if let Err(e) = self.destroy(&id).await {
                debug!("[{}] Skipped during shutdown: {}", id, e);
            }
        }
        info!("✅ All tunnels stopped");
    }

    pub async fn stats(&self) -> Result<EngineStats, TunnelError> {
        Ok(EngineStats {
            servers: self.store.list_servers()?.len(),
            tunnels: self.store.list_tunnels()?.len(),
            active: self.registry.active_ids().await.len(),
        })
    }

    pub(crate) async fn create_locked(
        &self,
        id: &str,
        slot: &mut Option<ActiveTunnel>,
    ) -> Result<String, TunnelError> {
        if slot.is_some() {
            return Err(TunnelError::AlreadyActive(id.to_string()));
        }

        let (tunnel, server) = self.resolve(id)?;
        info!(
            "[{}] Creating {} tunnel on local port {} via {}",
            id,
            tunnel.kind,
            tunnel.local_port,
            server.ssh_endpoint()
        );

        let topology = match self.build(&tunnel, &server).await {
            Ok(topology) => topology,
            Err(e) => {
                warn!("[{}] Create failed: {}", id, e);
                return Err(e);
            }
        };

        let pid = topology.primary_pid();
        if let Err(e) = self
            .store
            .set_tunnel_status(id, TunnelStatus::Active, Some(pid))
        {
            error!("[{}] Failed to persist active status: {}", id, e);
            topology.teardown(&self.supervisor).await;
            return Err(e.into());
        }

        let message = format!(
            "Tunnel {} active on port {} (pid {})",
            id, tunnel.local_port, pid
        );
        self.record_event(EventKind::Connect, id, &message);
        *slot = Some(ActiveTunnel::new(tunnel, topology));

        info!("[{}] ✅ {}", id, message);
        Ok(message)
    }

    /// Returns false when nothing was registered
    pub(crate) async fn destroy_locked(&self, id: &str, slot: &mut Option<ActiveTunnel>) -> bool {
        let Some(active) = slot.take() else {
            return false;
        };

        info!("[{}] Stopping tunnel", id);
        active.topology.teardown(&self.supervisor).await;

        if let Err(e) = self
            .store
            .set_tunnel_status(id, TunnelStatus::Inactive, None)
        {
            warn!("[{}] Failed to persist inactive status: {}", id, e);
        }
        self.record_event(EventKind::Disconnect, id, "Tunnel stopped");
        true
    }

    pub(crate) fn record_event(&self, kind: EventKind, id: &str, message: &str) {
        if let Err(e) = self.store.record_event(kind, id, message) {
            warn!("[{}] Failed to record {} event: {}", id, kind, e);
        }
    }

    pub(crate) async fn report(active: &mut ActiveTunnel) -> StatusReport {
        let health = active.topology.health(active.config.local_port).await;
        let status = if health.is_healthy() {
            TunnelStatus::Active
        } else {
            TunnelStatus::Dead
        };

        StatusReport {
            id: active.config.id.clone(),
            status,
            kind: Some(active.topology.kind()),
            local_port: Some(active.config.local_port),
            pid: Some(active.topology.primary_pid()),
            processes: active
                .topology
                .pids()
                .into_iter()
                .map(|(role, pid)| format!("{}:{}", role, pid))
                .collect(),
            started_at: Some(active.started_at_utc),
            uptime: Some(active.started_at.elapsed()),
            bytes_in: active.monitor.flushed_in,
            bytes_out: active.monitor.flushed_out,
            detail: (!health.is_healthy()).then(|| health.to_string()),
        }
    }

    fn tunnel(&self, id: &str) -> Result<TunnelConfig, TunnelError> {
        self.store
            .get_tunnel(id)?
            .ok_or_else(|| TunnelError::ConfigNotFound(id.to_string()))
    }

    fn resolve(&self, id: &str) -> Result<(TunnelConfig, ServerConfig), TunnelError> {
        let tunnel = self.tunnel(id)?;
        let server = self.store.get_server(&tunnel.server_id)?.ok_or_else(|| {
            TunnelError::ConfigNotFound(format!("server {} of tunnel {}", tunnel.server_id, id))
        })?;
        Ok((tunnel, server))
    }

    async fn build(
        &self,
        tunnel: &TunnelConfig,
        server: &ServerConfig,
    ) -> Result<Topology, TunnelError> {
        if is_port_in_use(tunnel.local_port).await {
            return Err(TunnelError::PortInUse(tunnel.local_port));
        }
        if tunnel.kind == TunnelKind::Udp && !is_udp_port_free(tunnel.local_port) {
            return Err(TunnelError::PortInUse(tunnel.local_port));
        }

        let endpoint = server.ssh_endpoint();
        if !probe_reachable(&endpoint, self.config.reachability_timeout).await {
            return Err(TunnelError::RemoteUnreachable(endpoint));
        }

        match tunnel.kind {
            TunnelKind::Tcp => self.build_tcp(tunnel, server).await,
            TunnelKind::Udp => self.build_udp(tunnel, server).await,
        }
    }

    async fn build_tcp(
        &self,
        tunnel: &TunnelConfig,
        server: &ServerConfig,
    ) -> Result<Topology, TunnelError> {
        let spec = self.commands.secure_forward(
            server,
            &self.config.bind_address,
            tunnel.local_port,
            &tunnel.remote_host,
            tunnel.remote_port,
        );

        let mut forward = self.supervisor.spawn(&spec)?;
        if let Err(e) = self
            .supervisor
            .await_ready(
                &mut forward,
                ReadyProbe::Tcp(tunnel.local_port),
                self.config.forward_ready_timeout,
            )
            .await
        {
            self.supervisor.terminate(&mut forward).await;
            return Err(e);
        }

        Ok(Topology::Tcp { forward })
    }

    async fn build_udp(
        &self,
        tunnel: &TunnelConfig,
        server: &ServerConfig,
    ) -> Result<Topology, TunnelError> {
        let mut chain = UdpChain::default();

        if let Err(e) = self.assemble_udp(&mut chain, tunnel, server).await {
            debug!("[{}] Unwinding partial UDP chain", tunnel.id);
            chain.unwind(&self.supervisor).await;
            return Err(e);
        }

        match chain.into_topology() {
            Ok(topology) => Ok(topology),
            Err(incomplete) => {
                incomplete.unwind(&self.supervisor).await;
                Err(TunnelError::BindFailed("UDP chain incomplete".to_string()))
            }
        }
    }

    /// Start the chain members in order, recording each one in `chain`
    async fn assemble_udp(
        &self,
        chain: &mut UdpChain,
        tunnel: &TunnelConfig,
        server: &ServerConfig,
    ) -> Result<(), TunnelError> {
        let opened = self
            .executor
            .open_session(server)
            .await
            .map_err(TunnelError::RemoteSessionFailed)?;
        let session: &dyn RemoteSession = &**chain.session.insert(opened);

        ensure_remote_tooling(
            session,
            self.commands.relay_program(),
            self.config.remote_probe_timeout,
            self.config.remote_install_timeout,
        )
        .await?;

        let remote_port = find_remote_port(
            session,
            self.config.remote_port_range.clone(),
            self.config.remote_probe_timeout,
        )
        .await?;
        debug!("[{}] Remote relay port {}", tunnel.id, remote_port);

        let relay_command =
            self.commands
                .remote_relay(remote_port, &tunnel.remote_host, tunnel.remote_port);
        chain.remote = Some(
            RemoteRelay::start(
                session,
                &relay_command,
                remote_port,
                self.config.remote_probe_timeout,
                self.config.remote_relay_settle,
            )
            .await?,
        );

        let window = self.config.local_relay_window(tunnel.local_port);
        let forward_port = find_local_port(window).await?;
        chain.forward_port = Some(forward_port);
        debug!("[{}] Local TCP leg on port {}", tunnel.id, forward_port);

        let spec = self.commands.secure_forward(
            server,
            CHAIN_BIND_ADDRESS,
            forward_port,
            CHAIN_BIND_ADDRESS,
            remote_port,
        );
        let forward = chain.forward.insert(self.supervisor.spawn(&spec)?);
        self.supervisor
            .await_ready(
                forward,
                ReadyProbe::Tcp(forward_port),
                self.config.forward_ready_timeout,
            )
            .await?;

        let spec = self.commands.local_relay(tunnel.local_port, forward_port);
        let relay = chain.relay.insert(self.supervisor.spawn(&spec)?);
        self.supervisor
            .await_ready(
                relay,
                ReadyProbe::Udp(tunnel.local_port),
                self.config.relay_ready_timeout,
            )
            .await?;

        Ok(())
    }

    /// Probe the tunnel's local port; returns the round-trip time on success
    async fn probe_local(&self, tunnel: &TunnelConfig) -> Option<Duration> {
        let addr = SocketAddr::from(([127, 0, 0, 1], tunnel.local_port));
        let timeout = self.config.connectivity_timeout;
        let started = Instant::now();

        match tunnel.kind {
            TunnelKind::Tcp => match tokio::time::timeout(timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(_)) => Some(started.elapsed()),
                _ => None,
            },
            TunnelKind::Udp => {
                let socket = UdpSocket::bind("127.0.0.1:0").await.ok()?;
                socket.connect(addr).await.ok()?;
                tokio::time::timeout(timeout, socket.send(UDP_PROBE_PAYLOAD))
                    .await
                    .ok()?
                    .ok()?;
                let elapsed = started.elapsed();

                // A closed port answers with ICMP unreachable, surfaced on the next read
                let mut buf = [0u8; 64];
                match tokio::time::timeout(UDP_REFUSAL_WAIT, socket.recv(&mut buf)).await {
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => None,
                    _ => Some(elapsed),
                }
            }
        }
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
