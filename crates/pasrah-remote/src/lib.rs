//! Remote command execution on tunnel servers
//!
//! The tunnel engine only needs two things from a remote host: run a shell
//! command and get its exit status and output back, and keep a session open
//! long enough to start and later stop a relay process. [`RemoteExecutor`]
//! and [`RemoteSession`] are those contracts; [`SshExecutor`] implements them
//! with the system OpenSSH client.

pub mod options;
pub mod ssh;

pub use options::SshOptions;
pub use ssh::{SshExecutor, SshSession};

use async_trait::async_trait;
use pasrah_proto::ServerConfig;
use std::time::Duration;
use thiserror::Error;

/// Remote execution errors
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to spawn ssh client: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection to {server} failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    #[error("Remote session is closed")]
    SessionClosed,
}

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes commands on a server
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a single command over a fresh connection
    async fn run_command(
        &self,
        server: &ServerConfig,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Open a session that stays connected until closed
    async fn open_session(
        &self,
        server: &ServerConfig,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// A persistent connection to one server
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn run_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Close the session; closing twice is a no-op
    async fn close(&mut self);

    fn is_open(&self) -> bool;
}
