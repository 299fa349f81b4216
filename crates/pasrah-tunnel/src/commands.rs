//! Command lines for topology members
//!
//! [`TopologyCommands`] decides which programs implement each role. The
//! production builder runs `ssh -N -L` for secure forwards and `socat` for
//! both relays.

use pasrah_proto::ServerConfig;
use pasrah_remote::{RemoteSession, SshOptions};
use std::time::Duration;
use tracing::{info, warn};

use crate::process::{ProcessRole, ProcessSpec};
use crate::TunnelError;

/// Builds the processes of a tunnel topology
pub trait TopologyCommands: Send + Sync {
    /// Forward `bind_address:local_port` to `target_host:target_port` as seen from `server`
    fn secure_forward(
        &self,
        server: &ServerConfig,
        bind_address: &str,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> ProcessSpec;

    /// Accept UDP on `udp_port` and carry it over TCP to `127.0.0.1:tcp_port`
    fn local_relay(&self, udp_port: u16, tcp_port: u16) -> ProcessSpec;

    /// Shell command run on the server: accept TCP on `listen_port`, relay to UDP target
    fn remote_relay(&self, listen_port: u16, target_host: &str, target_port: u16) -> String;

    /// Binary the remote relay needs on the server
    fn relay_program(&self) -> &str {
        "socat"
    }
}

/// OpenSSH forwards with socat relays
#[derive(Debug, Clone)]
pub struct SshSocatCommands {
    options: SshOptions,
    ssh_program: String,
    socat_program: String,
}

impl SshSocatCommands {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            ssh_program: "ssh".to_string(),
            socat_program: "socat".to_string(),
        }
    }
}

impl TopologyCommands for SshSocatCommands {
    fn secure_forward(
        &self,
        server: &ServerConfig,
        bind_address: &str,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> ProcessSpec {
        ProcessSpec::new(ProcessRole::SecureForward, self.ssh_program.as_str()).args(
            self.options
                .forward_args(server, bind_address, local_port, target_host, target_port),
        )
    }

    fn local_relay(&self, udp_port: u16, tcp_port: u16) -> ProcessSpec {
        ProcessSpec::new(ProcessRole::LocalRelay, self.socat_program.as_str())
            .arg(format!("UDP-LISTEN:{},fork,reuseaddr", udp_port))
            .arg(format!("TCP:127.0.0.1:{}", tcp_port))
    }

    fn remote_relay(&self, listen_port: u16, target_host: &str, target_port: u16) -> String {
        format!(
            "socat TCP-LISTEN:{},fork,reuseaddr UDP:{}:{}",
            listen_port, target_host, target_port
        )
    }
}

/// Exits 0 when `program` is on the remote PATH
pub fn tooling_check(program: &str) -> String {
    format!("command -v {} >/dev/null 2>&1", program)
}

/// Installs `program` with whichever package manager the server has
pub fn tooling_install(program: &str) -> String {
    format!(
        "if command -v apt-get >/dev/null 2>&1; then \
         apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y {p}; \
         else yum install -y {p} || dnf install -y {p}; fi",
        p = program
    )
}

async fn relay_present(
    session: &dyn RemoteSession,
    program: &str,
    timeout: Duration,
) -> Result<bool, TunnelError> {
    session
        .run_command(&tooling_check(program), timeout)
        .await
        .map(|output| output.success())
        .map_err(|e| TunnelError::RemoteToolingUnavailable(e.to_string()))
}

/// Make sure the relay binary exists on the server, installing it if needed
pub async fn ensure_remote_tooling(
    session: &dyn RemoteSession,
    program: &str,
    probe_timeout: Duration,
    install_timeout: Duration,
) -> Result<(), TunnelError> {
    if relay_present(session, program, probe_timeout).await? {
        return Ok(());
    }

    info!("{} missing on remote host, installing", program);
    match session
        .run_command(&tooling_install(program), install_timeout)
        .await
    {
        Ok(output) if !output.success() => {
            warn!(
                "Installing {} failed ({}): {}",
                program,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(_) => {}
        Err(e) => return Err(TunnelError::RemoteToolingUnavailable(e.to_string())),
    }

    if relay_present(session, program, probe_timeout).await? {
        info!("{} installed on remote host", program);
        Ok(())
    } else {
        Err(TunnelError::RemoteToolingUnavailable(format!(
            "{} is not installed and could not be installed",
            program
        )))
    }
}
