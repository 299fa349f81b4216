//! Tunnel lifecycle errors

use pasrah_proto::ValidationError;
use pasrah_remote::RemoteError;
use pasrah_store::StoreError;
use thiserror::Error;

/// Failures reported by lifecycle operations
///
/// None of these leave the registry or the persisted status half-updated.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("Local port {0} is already in use")]
    PortInUse(u16),

    #[error("No free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Remote host {0} is unreachable")]
    RemoteUnreachable(String),

    #[error("Relay tooling unavailable on remote host: {0}")]
    RemoteToolingUnavailable(String),

    #[error("Failed to start remote relay: {0}")]
    RemoteSpawnFailed(String),

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Tunnel {0} is not active")]
    NotActive(String),

    #[error("Tunnel {0} is already active")]
    AlreadyActive(String),

    #[error("Failed to open remote session: {0}")]
    RemoteSessionFailed(#[source] RemoteError),

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Invalid tunnel: {0}")]
    Invalid(#[source] ValidationError),
}

impl TunnelError {
    /// Errors that retrying the same request can never fix
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            TunnelError::ConfigNotFound(_)
                | TunnelError::PortExhausted { .. }
                | TunnelError::Invalid(_)
        )
    }
}

impl From<StoreError> for TunnelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(e) => TunnelError::Invalid(e),
            other => TunnelError::Store(other),
        }
    }
}

impl From<ValidationError> for TunnelError {
    fn from(err: ValidationError) -> Self {
        TunnelError::Invalid(err)
    }
}
