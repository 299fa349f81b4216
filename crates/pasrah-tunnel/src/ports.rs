//! Port allocation and reachability probes
//!
//! Checks are best-effort: a port reported free is not reserved, so two
//! allocators scanning the same window can pick the same port. Callers that
//! care serialize their creates.

use pasrah_remote::RemoteSession;
use std::net::{SocketAddr, UdpSocket};
use std::ops::Range;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::TunnelError;

const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const UDP_SOCKET_TABLES: [&str; 2] = ["/proc/net/udp", "/proc/net/udp6"];

/// Whether something accepts TCP connections on `127.0.0.1:port`
pub async fn is_port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Whether the UDP port can be bound on all interfaces
pub fn is_udp_port_free(port: u16) -> bool {
    UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).is_ok()
}

/// Whether some local socket has UDP `port` bound
///
/// Reads the kernel socket tables so the check never holds the port itself;
/// where they are unavailable it falls back to a bind attempt.
pub fn is_udp_port_bound(port: u16) -> bool {
    let mut tables = UDP_SOCKET_TABLES
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .peekable();
    if tables.peek().is_none() {
        return !is_udp_port_free(port);
    }
    tables.any(|table| udp_table_has_port(&table, port))
}

/// Scan a `/proc/net/udp{,6}` table for a local address on `port`
fn udp_table_has_port(table: &str, port: u16) -> bool {
    table
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|local| local.rsplit(':').next())
        .any(|hex| u16::from_str_radix(hex, 16) == Ok(port))
}

/// First port in `range` nothing answers on locally
pub async fn find_local_port(range: Range<u16>) -> Result<u16, TunnelError> {
    for port in range.clone() {
        if port != 0 && !is_port_in_use(port).await {
            return Ok(port);
        }
    }
    Err(TunnelError::PortExhausted {
        start: range.start,
        end: range.end,
    })
}

/// Shell command that exits 0 when `port` has a listening socket
pub fn remote_port_probe(port: u16) -> String {
    format!(
        "(ss -lntu 2>/dev/null || netstat -lntu 2>/dev/null) | grep -q ':{} '",
        port
    )
}

/// First port in `range` with no listener on the session's host
///
/// One round-trip per candidate.
pub async fn find_remote_port(
    session: &dyn RemoteSession,
    range: Range<u16>,
    probe_timeout: Duration,
) -> Result<u16, TunnelError> {
    for port in range.clone() {
        let output = session
            .run_command(&remote_port_probe(port), probe_timeout)
            .await
            .map_err(TunnelError::RemoteSessionFailed)?;

        if !output.success() {
            debug!("Remote port {} is free", port);
            return Ok(port);
        }
    }
    Err(TunnelError::PortExhausted {
        start: range.start,
        end: range.end,
    })
}

/// Plain TCP connect to `endpoint` within `timeout`
pub async fn probe_reachable(endpoint: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Reachability probe to {} failed: {}", endpoint, e);
            false
        }
        Err(_) => {
            debug!("Reachability probe to {} timed out", endpoint);
            false
        }
    }
}
