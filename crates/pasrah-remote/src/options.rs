//! Command-line options shared by every ssh invocation

use pasrah_proto::{ServerConfig, Settings, DEFAULT_SSH_PORT};
use std::path::PathBuf;
use std::time::Duration;

/// Options applied to every ssh client process
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Key used when the server record has no identity file of its own
    pub default_identity: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub alive_interval: u32,
    pub alive_count_max: u32,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            default_identity: None,
            connect_timeout: Duration::from_secs(30),
            alive_interval: 30,
            alive_count_max: 3,
        }
    }
}

impl SshOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_identity: settings.private_key_path.clone(),
            connect_timeout: Duration::from_secs(settings.ssh_timeout.max(1)),
            ..Self::default()
        }
    }

    /// Key file for a server, if any
    pub fn identity_for<'a>(&'a self, server: &'a ServerConfig) -> Option<&'a PathBuf> {
        server
            .identity_file
            .as_ref()
            .or(self.default_identity.as_ref())
    }

    /// Arguments placed before the destination on every ssh command line
    pub fn base_args(&self, server: &ServerConfig) -> Vec<String> {
        let mut args = Vec::with_capacity(24);

        for option in [
            format!("ServerAliveInterval={}", self.alive_interval),
            format!("ServerAliveCountMax={}", self.alive_count_max),
            "ExitOnForwardFailure=yes".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "BatchMode=yes".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }

        if let Some(key) = self.identity_for(server) {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }

        if server.port != DEFAULT_SSH_PORT {
            args.push("-p".to_string());
            args.push(server.port.to_string());
        }

        args
    }

    /// Full argument list for a `-L` port forward with no remote command
    pub fn forward_args(
        &self,
        server: &ServerConfig,
        bind_address: &str,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Vec<String> {
        let mut args = self.base_args(server);
        args.push("-N".to_string());
        args.push("-L".to_string());
        args.push(format!(
            "{}:{}:{}:{}",
            bind_address, local_port, target_host, target_port
        ));
        args.push(server.destination());
        args
    }
}
