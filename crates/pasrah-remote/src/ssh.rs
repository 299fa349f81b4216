//! OpenSSH client implementation of the remote executor
//!
//! One-shot commands spawn `ssh user@host <cmd>`. Sessions start a
//! ControlMaster, wait for `-O check` to answer, and multiplex later commands
//! over its control socket, so a relay started in the session can be stopped
//! through the same connection.

use async_trait::async_trait;
use pasrah_proto::ServerConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CommandOutput, RemoteError, RemoteExecutor, RemoteSession, SshOptions};

const SSH_PROGRAM: &str = "ssh";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Extra time granted on top of the connect timeout for the master handshake
const MASTER_GRACE: Duration = Duration::from_secs(5);
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Executor backed by the system `ssh` binary
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run_command(
        &self,
        server: &ServerConfig,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        let mut args = self.options.base_args(server);
        args.push(server.destination());
        args.push(command.to_string());

        debug!("[{}] running remote command: {}", server.id, command);
        run_ssh(&args, timeout).await
    }

    async fn open_session(
        &self,
        server: &ServerConfig,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let session = SshSession::open(&self.options, server).await?;
        Ok(Box::new(session))
    }
}

/// A ControlMaster connection to one server
pub struct SshSession {
    server_id: String,
    destination: String,
    base_args: Vec<String>,
    control_path: PathBuf,
    /// Client that spawned the master; it stays attached until the master exits
    master: Option<Child>,
    open: bool,
}

impl SshSession {
    async fn open(options: &SshOptions, server: &ServerConfig) -> Result<Self, RemoteError> {
        let id = Uuid::new_v4().simple().to_string();
        let control_path = std::env::temp_dir().join(format!("pasrah-{}.sock", &id[..12]));

        let mut args = options.base_args(server);
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-N".to_string(),
            server.destination(),
        ]);

        let master = Command::new(SSH_PROGRAM)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut session = Self {
            server_id: server.id.clone(),
            destination: server.destination(),
            base_args: options.base_args(server),
            control_path,
            master: Some(master),
            open: true,
        };

        let timeout = options.connect_timeout + MASTER_GRACE;
        match session.wait_for_master(timeout).await {
            Ok(()) => {
                debug!(
                    "[{}] opened control session at {}",
                    server.id,
                    session.control_path.display()
                );
                Ok(session)
            }
            Err(RemoteError::SessionClosed) => {
                session.open = false;
                let _ = std::fs::remove_file(&session.control_path);
                Err(RemoteError::ConnectionFailed {
                    server: server.ssh_endpoint(),
                    reason: session.master_stderr().await,
                })
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Poll `-O check` until the master answers; `SessionClosed` if it exits first
    async fn wait_for_master(&mut self, timeout: Duration) -> Result<(), RemoteError> {
        let deadline = Instant::now() + timeout;
        loop {
            let check = run_ssh(&self.control_args(&["-O", "check"]), CHECK_TIMEOUT).await?;
            if check.success() {
                return Ok(());
            }

            if let Some(master) = self.master.as_mut() {
                if let Ok(Some(status)) = master.try_wait() {
                    debug!("[{}] ssh master exited: {}", self.server_id, status);
                    return Err(RemoteError::SessionClosed);
                }
            }

            if Instant::now() >= deadline {
                return Err(RemoteError::Timeout(timeout));
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// What an exited master wrote to stderr
    async fn master_stderr(&mut self) -> String {
        let mut stderr = String::new();
        if let Some(stream) = self.master.as_mut().and_then(|m| m.stderr.as_mut()) {
            let _ = tokio::time::timeout(CHECK_TIMEOUT, stream.read_to_string(&mut stderr)).await;
        }
        let stderr = stderr.trim();
        if stderr.is_empty() {
            "ssh master exited before the control socket was ready".to_string()
        } else {
            stderr.to_string()
        }
    }

    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    fn control_args(&self, extra: &[&str]) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]);
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push(self.destination.clone());
        args
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        if !self.open {
            return Err(RemoteError::SessionClosed);
        }

        let mut args = self.control_args(&["-T"]);
        args.push(command.to_string());

        debug!("[{}] session command: {}", self.server_id, command);
        run_ssh(&args, timeout).await
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let args = self.control_args(&["-O", "exit"]);
        match run_ssh(&args, CLOSE_TIMEOUT).await {
            Ok(output) if output.success() => {
                debug!("[{}] control session closed", self.server_id)
            }
            Ok(output) => warn!(
                "[{}] control session exit failed: {}",
                self.server_id,
                failure_reason(&output)
            ),
            Err(e) => warn!("[{}] failed to close control session: {}", self.server_id, e),
        }

        if let Some(mut master) = self.master.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, master.wait())
                .await
                .is_err()
            {
                let _ = master.kill().await;
            }
        }
        let _ = std::fs::remove_file(&self.control_path);
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        // Sessions dropped without close still must not leave a master behind
        let args = self.control_args(&["-O", "exit"]);
        let _ = std::process::Command::new(SSH_PROGRAM)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Some(master) = self.master.as_mut() {
            let _ = master.start_kill();
        }
        let _ = std::fs::remove_file(&self.control_path);
    }
}

async fn run_ssh(args: &[String], timeout: Duration) -> Result<CommandOutput, RemoteError> {
    let mut command = Command::new(SSH_PROGRAM);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| RemoteError::Timeout(timeout))??;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn failure_reason(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("ssh exited with status {}", output.exit_code)
    } else {
        stderr.to_string()
    }
}
