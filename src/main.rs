//! PasRah CLI - SSH tunnel manager
//!
//! Keeps TCP and UDP tunnels to remote servers running, restarting them
//! when they die.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pasrah_proto::{ServerConfig, TunnelConfig, TunnelKind};
use pasrah_remote::{SshExecutor, SshOptions};
use pasrah_store::{FileStore, TunnelStore};
use pasrah_tunnel::{EngineConfig, SshSocatCommands, TunnelManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PasRah - Keep SSH tunnels to your servers alive
#[derive(Parser, Debug)]
#[command(name = "pasrah")]
#[command(about = "Manage TCP and UDP tunnels over SSH", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding configuration and logs (default: ~/.pasrah)
    #[arg(long, global = true, env = "PASRAH_HOME")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage remote servers
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Manage tunnel definitions
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },

    /// Run tunnels in the foreground and restart them when they die
    #[command(long_about = r#"
Start tunnels and monitor them until Ctrl+C. With no ids, every tunnel
with auto-restart enabled is started.

EXAMPLES:
  # Start every enabled tunnel
  pasrah run

  # Start two specific tunnels
  pasrah run web_8080 dns_5353
    "#)]
    Run {
        /// Tunnel ids to start (default: all enabled)
        ids: Vec<String>,
    },

    /// Probe a tunnel's local port and show recent traffic
    Check {
        /// Tunnel id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommands {
    /// Add a server
    Add {
        /// Server id used by tunnels
        id: String,

        /// Hostname or IP address
        host: String,

        /// SSH user
        #[arg(short, long)]
        user: String,

        /// SSH port
        #[arg(short, long, default_value_t = pasrah_proto::DEFAULT_SSH_PORT)]
        port: u16,

        /// Private key for this server
        #[arg(short, long)]
        identity: Option<PathBuf>,
    },

    /// List servers
    List,

    /// Remove a server
    Remove {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelCommands {
    /// Add a tunnel
    Add {
        /// Tunnel name
        name: String,

        /// Server to tunnel through
        #[arg(short, long)]
        server: String,

        /// Local port to listen on
        #[arg(short, long)]
        local_port: u16,

        /// Target port, reached from the server
        #[arg(short, long)]
        remote_port: u16,

        /// Target host, resolved on the server
        #[arg(long, default_value = "localhost")]
        remote_host: String,

        /// Tunnel type (tcp, udp)
        #[arg(short = 't', long = "type", default_value = "tcp")]
        kind: TunnelKind,

        /// Do not start it with `pasrah run`
        #[arg(long)]
        disabled: bool,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List tunnels
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove a tunnel
    Remove {
        id: String,
    },

    /// Enable auto-start and auto-restart
    Enable {
        id: String,
    },

    /// Disable auto-start and auto-restart
    Disable {
        id: String,
    },

    /// Show recent events
    Events {
        /// Only events of this tunnel
        id: Option<String>,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

/// Setup logging; RUST_LOG overrides the verbosity flag
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();
}

fn open_store(data_dir: Option<PathBuf>) -> Result<Arc<FileStore>> {
    let store = match data_dir {
        Some(dir) => FileStore::with_base_dir(dir),
        None => FileStore::new(),
    }
    .context("Failed to open configuration store")?;
    Ok(Arc::new(store))
}

fn build_manager(store: Arc<FileStore>) -> Result<Arc<TunnelManager>> {
    let settings = store.settings().context("Failed to read settings")?;
    let options = SshOptions::from_settings(&settings);

    Ok(Arc::new(TunnelManager::new(
        store,
        Arc::new(SshExecutor::new(options.clone())),
        Arc::new(SshSocatCommands::new(options)),
        EngineConfig::from_settings(&settings),
    )))
}

fn handle_server_command(store: &FileStore, command: ServerCommands) -> Result<()> {
    match command {
        ServerCommands::Add {
            id,
            host,
            user,
            port,
            identity,
        } => {
            let mut server = ServerConfig::new(&id, &host, &user).with_port(port);
            if let Some(identity) = identity {
                server = server.with_identity_file(identity);
            }
            store.add_server(server)?;
            println!("✅ Server '{}' added ({}@{}:{})", id, user, host, port);
        }
        ServerCommands::List => {
            let servers = store.list_servers()?;
            if servers.is_empty() {
                println!("No servers configured");
                println!("Add one with: pasrah server add <id> <host> --user <user>");
                return Ok(());
            }
            println!("Servers ({})", servers.len());
            for server in servers {
                println!("  {}  {}", server.id, server.ssh_endpoint());
            }
        }
        ServerCommands::Remove { id } => {
            if !store.remove_server(&id)? {
                bail!("Server '{}' not found", id);
            }
            println!("✅ Server '{}' removed", id);
        }
    }
    Ok(())
}

fn handle_tunnel_command(store: &FileStore, command: TunnelCommands) -> Result<()> {
    match command {
        TunnelCommands::Add {
            name,
            server,
            local_port,
            remote_port,
            remote_host,
            kind,
            disabled,
            description,
        } => {
            let tunnel = TunnelConfig::new(&name, &server, local_port, &remote_host, remote_port)
                .with_kind(kind)
                .with_auto_restart(!disabled)
                .with_description(&description);
            let id = tunnel.id.clone();
            store.add_tunnel(tunnel)?;

            println!("✅ Tunnel '{}' added", id);
            println!(
                "   {} localhost:{} -> {}:{} via {}",
                kind, local_port, remote_host, remote_port, server
            );
            if disabled {
                println!("   Status: Disabled (use 'pasrah tunnel enable {}')", id);
            } else {
                println!("   Status: Enabled (starts with 'pasrah run')");
            }
        }
        TunnelCommands::List { json } => {
            let tunnels = store.list_tunnels()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tunnels)?);
                return Ok(());
            }
            if tunnels.is_empty() {
                println!("No tunnels configured");
                println!("Add one with: pasrah tunnel add <name> --server <id> --local-port <port> --remote-port <port>");
                return Ok(());
            }
            println!("Tunnels ({})", tunnels.len());
            for tunnel in tunnels {
                let auto = if tunnel.auto_restart { "auto" } else { "manual" };
                println!(
                    "  {} {}  {} :{} -> {} via {} ({})",
                    tunnel.status.symbol(),
                    tunnel.id,
                    tunnel.kind,
                    tunnel.local_port,
                    tunnel.remote_endpoint(),
                    tunnel.server_id,
                    auto
                );
                if !tunnel.description.is_empty() {
                    println!("      {}", tunnel.description);
                }
            }
        }
        TunnelCommands::Remove { id } => {
            if !store.remove_tunnel(&id)? {
                bail!("Tunnel '{}' not found", id);
            }
            println!("✅ Tunnel '{}' removed", id);
        }
        TunnelCommands::Enable { id } => {
            store.set_auto_restart(&id, true)?;
            println!("✅ Tunnel '{}' enabled", id);
        }
        TunnelCommands::Disable { id } => {
            store.set_auto_restart(&id, false)?;
            println!("✅ Tunnel '{}' disabled", id);
        }
        TunnelCommands::Events { id, limit } => {
            let events = store.events(id.as_deref(), limit)?;
            if events.is_empty() {
                println!("No events recorded");
            }
            for event in events {
                println!(
                    "{}  {:<10} {}  {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.kind,
                    event.tunnel_id,
                    event.message
                );
            }
        }
    }
    Ok(())
}

/// Start tunnels, monitor them and tear everything down on Ctrl+C
async fn run_tunnels(manager: Arc<TunnelManager>, ids: Vec<String>) -> Result<()> {
    info!("PasRah starting...");

    if ids.is_empty() {
        let started = manager.start_enabled().await?;
        info!("Started {} tunnel(s)", started);
    } else {
        for id in &ids {
            match manager.create(id).await {
                Ok(message) => info!("{}", message),
                Err(e) if e.is_non_recoverable() => {
                    manager.shutdown().await;
                    return Err(e).with_context(|| format!("Cannot start tunnel {}", id));
                }
                Err(e) => error!("[{}] Failed to start: {}", id, e),
            }
        }
    }

    if manager.list_active().await.is_empty() {
        warn!("No tunnels running");
    }
    manager.start_monitor().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    manager.shutdown().await;
    info!("PasRah stopped");
    Ok(())
}

async fn check_tunnel(manager: Arc<TunnelManager>, id: &str) -> Result<()> {
    let report = manager.measure_latency(id).await?;
    match report.latency_ms {
        Some(ms) => println!("✅ {} reachable ({:.1} ms)", id, ms),
        None => println!("❌ {} not reachable", id),
    }
    println!("   Traffic in the last hour: {} bytes", report.bytes_last_hour);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let store = open_store(cli.data_dir)?;

    match cli.command {
        Commands::Server { command } => handle_server_command(&store, command),
        Commands::Tunnel { command } => handle_tunnel_command(&store, command),
        Commands::Run { ids } => run_tunnels(build_manager(store)?, ids).await,
        Commands::Check { id } => check_tunnel(build_manager(store)?, &id).await,
    }
}
