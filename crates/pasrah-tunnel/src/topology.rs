//! Process topologies of active tunnels

use pasrah_proto::TunnelKind;
use pasrah_remote::RemoteSession;
use std::fmt;
use tracing::debug;

use crate::ports::is_port_in_use;
use crate::process::{ProcessHandle, ProcessRole, ProcessSupervisor, RemoteRelay};

/// The OS processes implementing one active tunnel
pub enum Topology {
    /// A single secure forward on the tunnel's local port
    Tcp { forward: ProcessHandle },
    /// Remote relay, secure forward to it, local relay in front of the forward
    Udp {
        remote: RemoteRelay,
        forward: ProcessHandle,
        relay: ProcessHandle,
        /// Local TCP port joining the local relay to the forward
        forward_port: u16,
        session: Box<dyn RemoteSession>,
    },
}

/// Outcome of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// The forward is running but its port no longer accepts connections
    PortNotListening,
    ProcessExited(ProcessRole),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => f.write_str("healthy"),
            Health::PortNotListening => f.write_str("process running but port not listening"),
            Health::ProcessExited(role) => write!(f, "{} process exited", role),
        }
    }
}

impl Topology {
    pub fn kind(&self) -> TunnelKind {
        match self {
            Topology::Tcp { .. } => TunnelKind::Tcp,
            Topology::Udp { .. } => TunnelKind::Udp,
        }
    }

    /// Pid persisted as the tunnel's pid
    pub fn primary_pid(&self) -> u32 {
        match self {
            Topology::Tcp { forward } | Topology::Udp { forward, .. } => forward.pid(),
        }
    }

    /// Every member in creation order; the remote relay pid is remote
    pub fn pids(&self) -> Vec<(ProcessRole, u32)> {
        match self {
            Topology::Tcp { forward } => vec![(ProcessRole::SecureForward, forward.pid())],
            Topology::Udp {
                remote,
                forward,
                relay,
                ..
            } => vec![
                (ProcessRole::RemoteRelay, remote.pid),
                (ProcessRole::SecureForward, forward.pid()),
                (ProcessRole::LocalRelay, relay.pid()),
            ],
        }
    }

    pub fn member_count(&self) -> usize {
        match self {
            Topology::Tcp { .. } => 1,
            Topology::Udp { .. } => 3,
        }
    }

    /// TCP: alive and accepting on `local_port`. UDP: both local members alive;
    /// the remote relay is not re-checked.
    pub async fn health(&mut self, local_port: u16) -> Health {
        match self {
            Topology::Tcp { forward } => {
                if !forward.is_alive() {
                    Health::ProcessExited(ProcessRole::SecureForward)
                } else if !is_port_in_use(local_port).await {
                    Health::PortNotListening
                } else {
                    Health::Healthy
                }
            }
            Topology::Udp { forward, relay, .. } => {
                if !forward.is_alive() {
                    Health::ProcessExited(ProcessRole::SecureForward)
                } else if !relay.is_alive() {
                    Health::ProcessExited(ProcessRole::LocalRelay)
                } else {
                    Health::Healthy
                }
            }
        }
    }

    /// Terminate every member in reverse creation order and close the session
    pub async fn teardown(self, supervisor: &ProcessSupervisor) {
        match self {
            Topology::Tcp { mut forward } => supervisor.terminate(&mut forward).await,
            Topology::Udp {
                remote,
                forward,
                relay,
                session,
                ..
            } => {
                let chain = UdpChain {
                    session: Some(session),
                    remote: Some(remote),
                    forward: Some(forward),
                    relay: Some(relay),
                    forward_port: None,
                };
                chain.unwind(supervisor).await;
            }
        }
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("kind", &self.kind())
            .field("pids", &self.pids())
            .finish()
    }
}

/// A UDP chain under construction
///
/// Each member is recorded as soon as it is started so a failure at any step
/// can unwind exactly what exists, newest first.
#[derive(Default)]
pub struct UdpChain {
    pub session: Option<Box<dyn RemoteSession>>,
    pub remote: Option<RemoteRelay>,
    pub forward: Option<ProcessHandle>,
    pub relay: Option<ProcessHandle>,
    pub forward_port: Option<u16>,
}

impl UdpChain {
    /// Seal a fully built chain; an incomplete chain is handed back
    pub fn into_topology(self) -> Result<Topology, Self> {
        match self {
            UdpChain {
                session: Some(session),
                remote: Some(remote),
                forward: Some(forward),
                relay: Some(relay),
                forward_port: Some(forward_port),
            } => Ok(Topology::Udp {
                remote,
                forward,
                relay,
                forward_port,
                session,
            }),
            incomplete => Err(incomplete),
        }
    }

    /// Stop whatever was started: local relay, forward, remote relay, session
    pub async fn unwind(self, supervisor: &ProcessSupervisor) {
        let UdpChain {
            session,
            remote,
            forward,
            relay,
            ..
        } = self;

        if let Some(mut relay) = relay {
            supervisor.terminate(&mut relay).await;
        }
        if let Some(mut forward) = forward {
            supervisor.terminate(&mut forward).await;
        }
        if let Some(mut session) = session {
            if let Some(remote) = remote {
                remote.terminate(session.as_ref()).await;
            }
            session.close().await;
            debug!("Remote session closed");
        }
    }
}
