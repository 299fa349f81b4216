//! PasRah shared data model
//!
//! Records shared by the tunnel engine, the persistence sink and the remote
//! executor: tunnel and server configuration, lifecycle status, event log
//! entries and engine settings.

pub mod event;
pub mod server;
pub mod settings;
pub mod tunnel;

pub use event::{BandwidthSample, EventKind, TunnelEvent};
pub use server::ServerConfig;
pub use settings::Settings;
pub use tunnel::{TunnelConfig, TunnelKind, TunnelStatus, ValidationError};

/// Default SSH port for remote servers
pub const DEFAULT_SSH_PORT: u16 = 22;
