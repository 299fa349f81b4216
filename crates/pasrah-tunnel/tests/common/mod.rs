//! Shared fixtures for lifecycle and monitor tests
//!
//! `LoopbackCommands` swaps the ssh client for a local socat TCP forward and
//! `LocalShellExecutor` runs "remote" commands in a local shell, so whole
//! tunnel chains can be built on one machine.

#![allow(dead_code)]

use async_trait::async_trait;
use pasrah_proto::{ServerConfig, TunnelConfig, TunnelKind};
use pasrah_remote::{CommandOutput, RemoteError, RemoteExecutor, RemoteSession};
use pasrah_store::{MemoryStore, TunnelStore};
use pasrah_tunnel::{
    EngineConfig, ProcessRole, ProcessSpec, StatusReport, TopologyCommands, TunnelManager,
};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::Command;

pub const SERVER_ID: &str = "local";

pub fn socat_available() -> bool {
    which::which("socat").is_ok()
}

/// A port nothing is bound to right now
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Topology commands that stand in local socat processes for ssh
#[derive(Default)]
pub struct LoopbackCommands {
    spawned: AtomicUsize,
}

impl LoopbackCommands {
    /// Number of local process specs handed out
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl TopologyCommands for LoopbackCommands {
    fn secure_forward(
        &self,
        _server: &ServerConfig,
        bind_address: &str,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> ProcessSpec {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        ProcessSpec::new(ProcessRole::SecureForward, "socat")
            .arg(format!(
                "TCP-LISTEN:{},bind={},fork,reuseaddr",
                local_port, bind_address
            ))
            .arg(format!("TCP:{}:{}", target_host, target_port))
    }

    fn local_relay(&self, udp_port: u16, tcp_port: u16) -> ProcessSpec {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        ProcessSpec::new(ProcessRole::LocalRelay, "socat")
            .arg(format!("UDP-LISTEN:{},fork,reuseaddr", udp_port))
            .arg(format!("TCP:127.0.0.1:{}", tcp_port))
    }

    fn remote_relay(&self, listen_port: u16, target_host: &str, target_port: u16) -> String {
        format!(
            "socat TCP-LISTEN:{},bind=127.0.0.1,fork,reuseaddr UDP:{}:{}",
            listen_port, target_host, target_port
        )
    }
}

/// Executor whose "remote host" is the local shell
///
/// Commands containing `fail_pattern` exit 1 without running.
#[derive(Default)]
pub struct LocalShellExecutor {
    log: Arc<Mutex<Vec<String>>>,
    fail_pattern: Option<String>,
    sessions: AtomicUsize,
}

impl LocalShellExecutor {
    pub fn failing_on(pattern: &str) -> Self {
        Self {
            fail_pattern: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

async fn run_local(
    log: &Mutex<Vec<String>>,
    fail_pattern: Option<&str>,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, RemoteError> {
    log.lock().unwrap().push(command.to_string());

    if fail_pattern.is_some_and(|p| command.contains(p)) {
        return Ok(CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "simulated failure".to_string(),
        });
    }

    let output = tokio::time::timeout(
        timeout,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| RemoteError::Timeout(timeout))??;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[async_trait]
impl RemoteExecutor for LocalShellExecutor {
    async fn run_command(
        &self,
        _server: &ServerConfig,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        run_local(&self.log, self.fail_pattern.as_deref(), command, timeout).await
    }

    async fn open_session(
        &self,
        _server: &ServerConfig,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalShellSession {
            log: self.log.clone(),
            fail_pattern: self.fail_pattern.clone(),
            open: true,
        }))
    }
}

pub struct LocalShellSession {
    log: Arc<Mutex<Vec<String>>>,
    fail_pattern: Option<String>,
    open: bool,
}

#[async_trait]
impl RemoteSession for LocalShellSession {
    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        if !self.open {
            return Err(RemoteError::SessionClosed);
        }
        run_local(&self.log, self.fail_pattern.as_deref(), command, timeout).await
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Accepts and drops connections, standing in for the server's ssh port
pub async fn fake_ssh_endpoint() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    port
}

/// TCP echo service acting as the tunnel target
pub async fn tcp_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Send `payload` through the tunnel's local port and read the echo
pub async fn tcp_roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Timings short enough for tests
pub fn test_config() -> EngineConfig {
    let remote_start = free_port();
    EngineConfig {
        bind_address: "127.0.0.1".to_string(),
        monitor_interval: Duration::from_millis(300),
        error_backoff: Duration::from_secs(1),
        bandwidth_flush_interval: Duration::ZERO,
        restart_delay: Duration::from_millis(200),
        reachability_timeout: Duration::from_secs(1),
        forward_ready_timeout: Duration::from_secs(5),
        relay_ready_timeout: Duration::from_secs(2),
        terminate_grace: Duration::from_secs(2),
        remote_relay_settle: Duration::from_millis(300),
        remote_port_range: remote_start..remote_start.saturating_add(50),
        remote_probe_timeout: Duration::from_secs(5),
        remote_install_timeout: Duration::from_secs(5),
        connectivity_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub manager: Arc<TunnelManager>,
    pub store: Arc<MemoryStore>,
    pub executor: Arc<LocalShellExecutor>,
    pub commands: Arc<LoopbackCommands>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_executor(LocalShellExecutor::default(), test_config()).await
    }

    /// Harness whose server record points at a live fake ssh endpoint
    pub async fn with_executor(executor: LocalShellExecutor, config: EngineConfig) -> Self {
        let ssh_port = fake_ssh_endpoint().await;
        Self::build(executor, config, ssh_port)
    }

    /// Harness whose server record points at `ssh_port` as given
    pub fn build(executor: LocalShellExecutor, config: EngineConfig, ssh_port: u16) -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .add_server(ServerConfig::new(SERVER_ID, "127.0.0.1", "tester").with_port(ssh_port))
            .unwrap();

        let executor = Arc::new(executor);
        let commands = Arc::new(LoopbackCommands::default());
        let manager = Arc::new(TunnelManager::new(
            store.clone(),
            executor.clone(),
            commands.clone(),
            config,
        ));

        Self {
            manager,
            store,
            executor,
            commands,
        }
    }

    /// Persist a TCP tunnel to `target_port` on a fresh local port; returns its id
    pub fn add_tcp(&self, name: &str, target_port: u16, auto_restart: bool) -> TunnelConfig {
        let tunnel = TunnelConfig::new(name, SERVER_ID, free_port(), "127.0.0.1", target_port)
            .with_auto_restart(auto_restart);
        self.store.add_tunnel(tunnel.clone()).unwrap();
        tunnel
    }

    pub fn add_udp(&self, name: &str, target_port: u16) -> TunnelConfig {
        let tunnel = TunnelConfig::new(name, SERVER_ID, free_port(), "127.0.0.1", target_port)
            .with_kind(TunnelKind::Udp);
        self.store.add_tunnel(tunnel.clone()).unwrap();
        tunnel
    }

    /// Poll `get_status` until `accept` holds or `timeout` passes
    pub async fn wait_for_status(
        &self,
        id: &str,
        timeout: Duration,
        accept: impl Fn(&StatusReport) -> bool,
    ) -> StatusReport {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.manager.get_status(id).await;
            if accept(&report) || tokio::time::Instant::now() >= deadline {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// SIGKILL the process group led by `pid`, as an outside actor would
pub fn kill_group(pid: u32) {
    let _ = nix::sys::signal::killpg(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}
