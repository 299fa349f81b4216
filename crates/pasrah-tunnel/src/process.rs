//! Process supervision
//!
//! Every local member of a tunnel topology runs in its own process group so
//! the whole group (including relay children forked per connection) can be
//! signalled at once. The remote relay lives on the server and is only
//! reachable through the session that started it.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use pasrah_remote::RemoteSession;
use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::ports::{is_port_in_use, is_udp_port_bound};
use crate::TunnelError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const KILL_WAIT: Duration = Duration::from_secs(2);
const REMOTE_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Position of a process in a tunnel topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    RemoteRelay,
    SecureForward,
    LocalRelay,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::RemoteRelay => "remote-relay",
            ProcessRole::SecureForward => "secure-forward",
            ProcessRole::LocalRelay => "local-relay",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to run for one topology member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(role: ProcessRole, program: impl Into<String>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Printable command line (for logs)
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Condition that proves a process is doing its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyProbe {
    /// The TCP port accepts connections on loopback
    Tcp(u16),
    /// The UDP port is bound by someone; observed without binding it
    Udp(u16),
}

impl ReadyProbe {
    pub async fn check(&self) -> bool {
        match *self {
            ReadyProbe::Tcp(port) => is_port_in_use(port).await,
            ReadyProbe::Udp(port) => is_udp_port_bound(port),
        }
    }
}

impl fmt::Display for ReadyProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyProbe::Tcp(port) => write!(f, "tcp/{}", port),
            ReadyProbe::Udp(port) => write!(f, "udp/{}", port),
        }
    }
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A spawned local process
pub struct ProcessHandle {
    role: ProcessRole,
    pid: u32,
    child: Child,
    stderr: StderrTail,
    /// The leader's exit status has been collected
    reaped: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Non-blocking: true until an exit status has been observed
    pub fn is_alive(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => {
                self.reaped = true;
                false
            }
            Err(_) => false,
        }
    }

    /// Last lines the process wrote to stderr
    pub fn stderr_tail(&self) -> String {
        let tail = self
            .stderr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("role", &self.role)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Spawns, checks and terminates topology members
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    terminate_grace: Duration,
    stderr_tail_lines: usize,
}

impl ProcessSupervisor {
    pub fn new(terminate_grace: Duration, stderr_tail_lines: usize) -> Self {
        Self {
            terminate_grace,
            stderr_tail_lines,
        }
    }

    /// Launch `spec` detached into a new process group
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle, TunnelError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                TunnelError::BindFailed(format!("failed to start {}: {}", spec.program, e))
            })?;

        let pid = child.id().ok_or_else(|| {
            TunnelError::BindFailed(format!("{} exited before it could be tracked", spec.role))
        })?;

        debug!("Spawned {} (pid {}): {}", spec.role, pid, spec.command_line());

        let stderr: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stream) = child.stderr.take() {
            let tail = stderr.clone();
            let limit = self.stderr_tail_lines;
            let role = spec.role;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{} {}] {}", role, pid, line);
                    let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if tail.len() == limit {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        Ok(ProcessHandle {
            role: spec.role,
            pid,
            child,
            stderr,
            reaped: false,
        })
    }

    /// Poll `probe` until it passes or `timeout` elapses
    pub async fn wait_for_ready(&self, probe: ReadyProbe, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if probe.check().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Wait until `handle` passes `probe`, failing early if it exits
    pub async fn await_ready(
        &self,
        handle: &mut ProcessHandle,
        probe: ReadyProbe,
        timeout: Duration,
    ) -> Result<(), TunnelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !handle.is_alive() {
                // Give the stderr reader a moment to catch the last lines
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Err(TunnelError::BindFailed(self.describe_failure(
                    handle,
                    "exited immediately",
                )));
            }
            if probe.check().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::BindFailed(self.describe_failure(
                    handle,
                    &format!("{} not ready after {:?}", probe, timeout),
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn describe_failure(&self, handle: &ProcessHandle, what: &str) -> String {
        let stderr = handle.stderr_tail();
        if stderr.is_empty() {
            format!("{} (pid {}) {}", handle.role, handle.pid, what)
        } else {
            format!("{} (pid {}) {}: {}", handle.role, handle.pid, what, stderr)
        }
    }

    /// SIGTERM the process group, then SIGKILL after the grace period
    ///
    /// Never fails: groups that are already gone are ignored.
    pub async fn terminate(&self, handle: &mut ProcessHandle) {
        if handle.reaped {
            // Forked children may outlive the leader; an empty group's id is free for reuse
            if group_outlives_leader(handle.pid) {
                debug!(
                    "{} (pid {}) exited, stopping its remaining group",
                    handle.role, handle.pid
                );
                signal_group(handle.pid, Signal::SIGTERM);
            }
            return;
        }

        signal_group(handle.pid, Signal::SIGTERM);

        if tokio::time::timeout(self.terminate_grace, handle.child.wait())
            .await
            .is_ok()
        {
            handle.reaped = true;
            debug!("{} (pid {}) terminated", handle.role, handle.pid);
            return;
        }

        warn!(
            "{} (pid {}) ignored SIGTERM for {:?}, killing",
            handle.role, handle.pid, self.terminate_grace
        );
        signal_group(handle.pid, Signal::SIGKILL);
        match tokio::time::timeout(KILL_WAIT, handle.child.wait()).await {
            Ok(_) => handle.reaped = true,
            Err(_) => warn!("{} (pid {}) did not exit after SIGKILL", handle.role, handle.pid),
        }
    }
}

fn group_id(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Whether the group of a reaped leader still has members
///
/// A pid stays allocated while a group still uses it as its id, so a live
/// process holding `pid` means the group is gone and the number was reused.
fn group_outlives_leader(pid: u32) -> bool {
    let Some(pgid) = group_id(pid) else {
        return false;
    };
    if kill(pgid, None) != Err(Errno::ESRCH) {
        return false;
    }
    killpg(pgid, None).is_ok()
}

fn signal_group(pid: u32, signal: Signal) {
    let Some(pgid) = group_id(pid) else {
        return;
    };
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {:?} to process group {}: {}", signal, pid, e),
    }
}

/// Relay process started on the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRelay {
    pub pid: u32,
    pub port: u16,
}

impl RemoteRelay {
    /// Start `command` in the background through `session` and record its pid
    pub async fn start(
        session: &dyn RemoteSession,
        command: &str,
        port: u16,
        timeout: Duration,
        settle: Duration,
    ) -> Result<Self, TunnelError> {
        let wrapped = format!("nohup {} > /dev/null 2>&1 & echo $!", command);
        let output = session
            .run_command(&wrapped, timeout)
            .await
            .map_err(|e| TunnelError::RemoteSpawnFailed(e.to_string()))?;

        if !output.success() {
            return Err(TunnelError::RemoteSpawnFailed(output.stderr.trim().to_string()));
        }

        let pid = output
            .stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                TunnelError::RemoteSpawnFailed(format!(
                    "no pid in relay start output: {:?}",
                    output.stdout.trim()
                ))
            })?;

        let relay = Self { pid, port };

        tokio::time::sleep(settle).await;
        if !relay.is_alive(session, timeout).await {
            return Err(TunnelError::RemoteSpawnFailed(format!(
                "relay (pid {}) exited right after start",
                pid
            )));
        }

        info!("Remote relay started on port {} (pid {})", port, pid);
        Ok(relay)
    }

    /// Advisory: asks the remote host whether the pid still exists
    pub async fn is_alive(&self, session: &dyn RemoteSession, timeout: Duration) -> bool {
        if !session.is_open() {
            return false;
        }
        session
            .run_command(&format!("kill -0 {}", self.pid), timeout)
            .await
            .map(|output| output.success())
            .unwrap_or(false)
    }

    /// Best-effort `kill <pid>`; a closed session makes this a no-op
    pub async fn terminate(&self, session: &dyn RemoteSession) {
        if !session.is_open() {
            debug!(
                "Session closed, leaving remote relay (pid {}) alone",
                self.pid
            );
            return;
        }

        match session
            .run_command(
                &format!("kill {} 2>/dev/null || true", self.pid),
                REMOTE_KILL_TIMEOUT,
            )
            .await
        {
            Ok(_) => debug!("Remote relay (pid {}) terminated", self.pid),
            Err(e) => warn!("Failed to stop remote relay (pid {}): {}", self.pid, e),
        }
    }
}
