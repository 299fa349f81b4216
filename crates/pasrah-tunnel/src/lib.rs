//! Tunnel lifecycle and process supervision engine
//!
//! Turns configured tunnels into running process chains and keeps them
//! alive:
//!
//! - TCP tunnels are a single secure forward (`ssh -N -L`).
//! - UDP tunnels are a three-process chain: a relay on the server turning a
//!   TCP port into the UDP target, a secure forward to that port, and a local
//!   relay accepting UDP datagrams in front of the forward.
//!
//! [`TunnelManager`] owns the registry of active tunnels and exposes
//! create/destroy/restart/status; its monitor task restarts tunnels that die.
//!
//! # Example
//!
//! ```ignore
//! use pasrah_tunnel::{EngineConfig, SshSocatCommands, TunnelManager};
//!
//! let manager = Arc::new(TunnelManager::new(store, executor, commands, EngineConfig::default()));
//! manager.start_enabled().await?;
//! manager.start_monitor().await;
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod ports;
pub mod process;
pub mod registry;
pub mod status;
pub mod topology;

pub use commands::{SshSocatCommands, TopologyCommands};
pub use config::EngineConfig;
pub use error::TunnelError;
pub use manager::TunnelManager;
pub use monitor::{CycleReport, MonitorHandle};
pub use process::{ProcessHandle, ProcessRole, ProcessSpec, ProcessSupervisor, ReadyProbe};
pub use status::{EngineStats, LatencyReport, StatusReport};
pub use topology::{Health, Topology};
