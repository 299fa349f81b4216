//! Background monitoring and auto-restart
//!
//! One task re-checks every registered tunnel each interval. Dead tunnels
//! are torn down, logged as a reconnect, and re-created when their record
//! has auto-restart enabled. A failing pass is logged and followed by a
//! longer backoff; the task only ends on [`TunnelManager::stop_monitor`].

use pasrah_proto::{EventKind, TunnelStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::ActiveTunnel;
use crate::topology::Health;
use crate::{TunnelError, TunnelManager};

/// Running monitor task
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Request a stop and wait for the current pass to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Monitor task ended abnormally: {}", e);
        }
    }
}

/// What one monitoring pass found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub healthy: usize,
    /// Tunnels found dead and torn down
    pub dead: Vec<String>,
    /// Dead tunnels that came back up
    pub restarted: Vec<String>,
    pub bandwidth_flushed: usize,
}

impl TunnelManager {
    /// Spawn the monitoring task; returns false if one is already running
    pub async fn start_monitor(self: &Arc<Self>) -> bool {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(MonitorHandle::is_running) {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_monitor(self.clone(), cancel.clone()));
        *monitor = Some(MonitorHandle { cancel, task });
        true
    }

    pub async fn stop_monitor(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn is_monitor_running(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(MonitorHandle::is_running)
    }

    /// One monitoring pass over every registered tunnel
    pub async fn run_cycle(&self) -> Result<CycleReport, TunnelError> {
        let mut report = CycleReport::default();
        let mut dead = Vec::new();

        for id in self.registry.known_ids() {
            let Some(slot) = self.registry.existing(&id) else {
                continue;
            };
            let mut guard = slot.lock().await;
            let Some(active) = guard.as_mut() else {
                continue;
            };

            report.checked += 1;
            active.monitor.last_checked = Some(Instant::now());

            let health = active.topology.health(active.config.local_port).await;
            if !health.is_healthy() {
                active.monitor.consecutive_failures += 1;
                let status = match health {
                    Health::PortNotListening => TunnelStatus::Degraded,
                    _ => TunnelStatus::Dead,
                };
                warn!("[{}] Tunnel {}: {}", id, status, health);
                dead.push(id.clone());
                continue;
            }

            active.monitor.consecutive_failures = 0;
            report.healthy += 1;

            if self.config.bandwidth_enabled
                && active.monitor.last_flush.elapsed() >= self.config.bandwidth_flush_interval
            {
                let (bytes_in, bytes_out, covered) = active.monitor.flush();
                match self
                    .store
                    .record_bandwidth(&id, bytes_in, bytes_out, covered)
                {
                    Ok(()) => report.bandwidth_flushed += 1,
                    Err(e) => warn!("[{}] Failed to record bandwidth: {}", id, e),
                }
            }
        }

        for id in dead {
            if self.recover(&id).await {
                report.restarted.push(id.clone());
            }
            report.dead.push(id);
        }

        Ok(report)
    }

    /// Tear down a dead tunnel and re-create it if allowed; true when it is back up
    async fn recover(&self, id: &str) -> bool {
        let Some(slot) = self.registry.existing(id) else {
            return false;
        };
        let restarted = self.recover_locked(id, &mut *slot.lock().await).await;
        drop(slot);
        self.registry.release(id);
        restarted
    }

    async fn recover_locked(&self, id: &str, guard: &mut Option<ActiveTunnel>) -> bool {
        // Someone may have destroyed or restarted it since the scan
        match guard.as_mut() {
            Some(active) => {
                if active
                    .topology
                    .health(active.config.local_port)
                    .await
                    .is_healthy()
                {
                    return false;
                }
            }
            None => return false,
        }
        let Some(active) = guard.take() else {
            return false;
        };

        active.topology.teardown(&self.supervisor).await;
        if let Err(e) = self.store.set_tunnel_status(id, TunnelStatus::Dead, None) {
            warn!("[{}] Failed to persist dead status: {}", id, e);
        }

        let auto_restart = match self.store.get_tunnel(id) {
            Ok(Some(tunnel)) => tunnel.auto_restart,
            Ok(None) => false,
            Err(e) => {
                warn!("[{}] Failed to read tunnel config: {}", id, e);
                false
            }
        };

        let message = if auto_restart {
            "Tunnel died, restarting"
        } else {
            "Tunnel died, auto-restart disabled"
        };
        self.record_event(EventKind::Reconnect, id, message);

        if !auto_restart {
            info!("[{}] {}", id, message);
            return false;
        }

        info!("[{}] 🔄 Restarting dead tunnel", id);
        match self.create_locked(id, guard).await {
            Ok(_) => true,
            Err(e) => {
                error!("[{}] Restart failed: {}", id, e);
                self.record_event(EventKind::Error, id, &format!("Restart failed: {}", e));
                false
            }
        }
    }
}

async fn run_monitor(manager: Arc<TunnelManager>, cancel: CancellationToken) {
    let interval = manager.config.monitor_interval;
    let backoff = manager.config.error_backoff;
    info!("Monitor started (interval {:?})", interval);

    while !cancel.is_cancelled() {
        // Run the pass as its own task so a panic inside it cannot end the loop
        let pass = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run_cycle().await }
        });

        let delay = match pass.await {
            Ok(Ok(report)) => {
                debug!(
                    "Monitor pass: {} checked, {} healthy, {} dead, {} restarted",
                    report.checked,
                    report.healthy,
                    report.dead.len(),
                    report.restarted.len()
                );
                interval
            }
            Ok(Err(e)) => {
                error!("Monitor pass failed: {}", e);
                backoff
            }
            Err(e) => {
                error!("Monitor pass panicked: {}", e);
                backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Monitor stopped");
}
