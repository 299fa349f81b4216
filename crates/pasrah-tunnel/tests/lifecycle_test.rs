//! Lifecycle tests against real local processes
//!
//! Tunnels that need running chains use socat and are skipped when it is
//! not installed.

mod common;

use common::{free_port, kill_group, socat_available, tcp_echo_server, Harness, SERVER_ID};
use pasrah_proto::{EventKind, TunnelConfig, TunnelKind, TunnelStatus};
use pasrah_store::TunnelStore;
use pasrah_tunnel::ports::is_port_in_use;
use pasrah_tunnel::{ProcessRole, StatusReport, TunnelError};
use std::time::Duration;

fn member_pid(report: &StatusReport, role: ProcessRole) -> u32 {
    let prefix = format!("{}:", role);
    report
        .processes
        .iter()
        .find_map(|entry| entry.strip_prefix(&prefix))
        .and_then(|pid| pid.parse().ok())
        .unwrap_or_else(|| panic!("no {} in {:?}", role, report.processes))
}

#[tokio::test]
async fn test_port_in_use_spawns_nothing() {
    let harness = Harness::new().await;
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let tunnel = TunnelConfig::new("busy", SERVER_ID, port, "127.0.0.1", 80);
    harness.store.add_tunnel(tunnel.clone()).unwrap();

    let err = harness.manager.create(&tunnel.id).await.unwrap_err();
    assert!(matches!(err, TunnelError::PortInUse(p) if p == port));
    assert_eq!(harness.commands.spawned(), 0);
    assert_eq!(harness.executor.sessions_opened(), 0);
    assert!(!harness.manager.get_status(&tunnel.id).await.is_active());
}

#[tokio::test]
async fn test_unknown_tunnel() {
    let harness = Harness::new().await;

    let err = harness.manager.create("ghost_1234").await.unwrap_err();
    assert!(matches!(err, TunnelError::ConfigNotFound(_)));
    assert!(err.is_non_recoverable());

    let err = harness.manager.destroy("ghost_1234").await.unwrap_err();
    assert!(matches!(err, TunnelError::NotActive(_)));

    let err = harness.manager.remove_tunnel("ghost_1234").await.unwrap_err();
    assert!(matches!(err, TunnelError::ConfigNotFound(_)));

    let err = harness.manager.restart("ghost_1234").await.unwrap_err();
    assert!(matches!(err, TunnelError::ConfigNotFound(_)));
    assert!(harness.manager.toggle("ghost_1234").await.is_err());

    // Failed operations leave nothing behind in the registry
    assert!(harness.manager.tracked_ids().is_empty());
}

#[tokio::test]
async fn test_unreachable_server() {
    let harness = Harness::build(
        common::LocalShellExecutor::default(),
        common::test_config(),
        free_port(),
    );
    let tunnel = harness.add_tcp("offline", 80, true);

    let err = harness.manager.create(&tunnel.id).await.unwrap_err();
    assert!(matches!(err, TunnelError::RemoteUnreachable(_)));
    assert_eq!(harness.commands.spawned(), 0);

    let stored = harness.store.get_tunnel(&tunnel.id).unwrap().unwrap();
    assert_eq!(stored.status, TunnelStatus::Inactive);
}

#[tokio::test]
async fn test_remote_tooling_unavailable() {
    let harness = Harness::with_executor(
        common::LocalShellExecutor::failing_on("socat"),
        common::test_config(),
    )
    .await;
    let tunnel = harness.add_udp("dns", 53);

    let err = harness.manager.create(&tunnel.id).await.unwrap_err();
    assert!(matches!(err, TunnelError::RemoteToolingUnavailable(_)));
    assert_eq!(harness.executor.sessions_opened(), 1);
    assert_eq!(harness.commands.spawned(), 0);
    assert!(harness.manager.list_active().await.is_empty());
}

#[tokio::test]
async fn test_tcp_tunnel_lifecycle() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    let tunnel = harness.add_tcp("web", echo, true);

    let message = harness.manager.create(&tunnel.id).await.unwrap();
    assert!(message.contains(&tunnel.local_port.to_string()));

    let report = harness.manager.get_status(&tunnel.id).await;
    assert_eq!(report.status, TunnelStatus::Active);
    assert_eq!(report.kind, Some(TunnelKind::Tcp));
    assert_eq!(report.processes.len(), 1);
    let pid = report.pid.unwrap();

    assert_eq!(
        common::tcp_roundtrip(tunnel.local_port, b"hello").await,
        b"hello"
    );
    assert!(harness.manager.test_connectivity(&tunnel.id).await.unwrap());

    let stored = harness.store.get_tunnel(&tunnel.id).unwrap().unwrap();
    assert_eq!(stored.status, TunnelStatus::Active);
    assert_eq!(stored.pid, Some(pid));

    harness.manager.destroy(&tunnel.id).await.unwrap();
    assert!(!harness.manager.get_status(&tunnel.id).await.is_active());
    assert!(!is_port_in_use(tunnel.local_port).await);

    let stored = harness.store.get_tunnel(&tunnel.id).unwrap().unwrap();
    assert_eq!(stored.status, TunnelStatus::Inactive);
    assert_eq!(stored.pid, None);

    let kinds: Vec<EventKind> = harness
        .store
        .events(Some(&tunnel.id), 10)
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EventKind::Disconnect, EventKind::Connect]);

    let err = harness.manager.destroy(&tunnel.id).await.unwrap_err();
    assert!(matches!(err, TunnelError::NotActive(_)));
}

#[tokio::test]
async fn test_create_twice_is_rejected() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    let tunnel = harness.add_tcp("api", echo, true);

    harness.manager.create(&tunnel.id).await.unwrap();
    let pid = harness.manager.get_status(&tunnel.id).await.pid;

    let err = harness.manager.create(&tunnel.id).await.unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyActive(_)));
    assert_eq!(harness.manager.get_status(&tunnel.id).await.pid, pid);
    assert_eq!(harness.commands.spawned(), 1);

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn test_restart_replaces_process() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    let tunnel = harness.add_tcp("db", echo, true);

    harness.manager.create(&tunnel.id).await.unwrap();
    let before = harness.manager.get_status(&tunnel.id).await.pid.unwrap();

    harness.manager.restart(&tunnel.id).await.unwrap();
    let report = harness.manager.get_status(&tunnel.id).await;
    assert_eq!(report.status, TunnelStatus::Active);
    assert_ne!(report.pid.unwrap(), before);
    assert_eq!(harness.manager.list_active().await.len(), 1);

    assert_eq!(
        common::tcp_roundtrip(tunnel.local_port, b"again").await,
        b"again"
    );

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn test_restart_inactive_creates() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    let tunnel = harness.add_tcp("cache", echo, true);

    harness.manager.restart(&tunnel.id).await.unwrap();
    assert!(harness.manager.get_status(&tunnel.id).await.is_active());

    harness.manager.shutdown().await;
    assert!(harness.manager.list_active().await.is_empty());
}

#[tokio::test]
async fn test_killed_forward_reports_dead() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    let tunnel = harness.add_tcp("metrics", echo, true);

    harness.manager.create(&tunnel.id).await.unwrap();
    let pid = harness.manager.get_status(&tunnel.id).await.pid.unwrap();
    kill_group(pid);

    let report = harness
        .wait_for_status(&tunnel.id, Duration::from_secs(5), |r| !r.is_active())
        .await;
    assert_eq!(report.status, TunnelStatus::Dead);
    assert!(report.detail.is_some());

    // Still registered, so destroy cleans it up
    harness.manager.destroy(&tunnel.id).await.unwrap();
    assert!(harness.manager.list_active().await.is_empty());
}

#[tokio::test]
async fn test_udp_chain_lifecycle() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let target = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let tunnel = harness.add_udp("dns", target.local_addr().unwrap().port());

    harness.manager.create(&tunnel.id).await.unwrap();

    let report = harness.manager.get_status(&tunnel.id).await;
    assert_eq!(report.status, TunnelStatus::Active);
    assert_eq!(report.kind, Some(TunnelKind::Udp));
    assert_eq!(report.processes.len(), 3);
    assert_eq!(
        report.pid,
        Some(member_pid(&report, ProcessRole::SecureForward))
    );
    let remote_pid = member_pid(&report, ProcessRole::RemoteRelay);
    let relay_pid = member_pid(&report, ProcessRole::LocalRelay);

    assert!(harness.manager.test_connectivity(&tunnel.id).await.unwrap());

    kill_group(relay_pid);
    let report = harness
        .wait_for_status(&tunnel.id, Duration::from_secs(5), |r| !r.is_active())
        .await;
    assert_eq!(report.status, TunnelStatus::Dead);

    harness.manager.destroy(&tunnel.id).await.unwrap();
    let kill = format!("kill {} ", remote_pid);
    assert!(harness
        .executor
        .commands()
        .iter()
        .any(|command| command.starts_with(&kill)));
}

#[tokio::test]
async fn test_udp_chain_forward_killed_reports_dead() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let target = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let tunnel = harness.add_udp("game", target.local_addr().unwrap().port());

    harness.manager.create(&tunnel.id).await.unwrap();
    let report = harness.manager.get_status(&tunnel.id).await;
    let forward_pid = member_pid(&report, ProcessRole::SecureForward);
    let relay_pid = member_pid(&report, ProcessRole::LocalRelay);
    assert_ne!(forward_pid, relay_pid);

    kill_group(forward_pid);
    let report = harness
        .wait_for_status(&tunnel.id, Duration::from_secs(5), |r| !r.is_active())
        .await;
    assert_eq!(report.status, TunnelStatus::Dead);

    // The local relay is still up, teardown stops it with the rest
    harness.manager.destroy(&tunnel.id).await.unwrap();
    assert!(harness.manager.list_active().await.is_empty());
    assert!(pasrah_tunnel::ports::is_udp_port_free(tunnel.local_port));
}

#[tokio::test]
async fn test_add_toggle_remove() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    let tunnel = TunnelConfig::new("admin", SERVER_ID, free_port(), "127.0.0.1", echo);

    let message = harness.manager.add_tunnel(tunnel.clone()).await.unwrap();
    assert!(message.contains("active"));
    assert!(harness.manager.get_status(&tunnel.id).await.is_active());

    harness.manager.toggle(&tunnel.id).await.unwrap();
    assert!(!harness.manager.get_status(&tunnel.id).await.is_active());

    harness.manager.toggle(&tunnel.id).await.unwrap();
    assert!(harness.manager.get_status(&tunnel.id).await.is_active());

    let stats = harness.manager.stats().await.unwrap();
    assert_eq!((stats.servers, stats.tunnels, stats.active), (1, 1, 1));

    harness.manager.remove_tunnel(&tunnel.id).await.unwrap();
    assert!(harness.store.get_tunnel(&tunnel.id).unwrap().is_none());
    assert!(harness.manager.tracked_ids().is_empty());
    assert!(harness.manager.list_active().await.is_empty());
    assert!(!is_port_in_use(tunnel.local_port).await);
}

#[tokio::test]
async fn test_add_disabled_tunnel_does_not_start() {
    let harness = Harness::new().await;
    let tunnel = TunnelConfig::new("later", SERVER_ID, free_port(), "127.0.0.1", 80)
        .with_auto_restart(false);

    harness.manager.add_tunnel(tunnel.clone()).await.unwrap();
    assert_eq!(harness.commands.spawned(), 0);

    let all = harness.manager.list_all().await.unwrap();
    assert_eq!(all[&tunnel.id].status, TunnelStatus::Inactive);
    assert_eq!(all[&tunnel.id].local_port, Some(tunnel.local_port));
}

#[tokio::test]
async fn test_start_enabled() {
    if !socat_available() {
        eprintln!("Skipping test: socat not installed");
        return;
    }

    let harness = Harness::new().await;
    let echo = tcp_echo_server().await;
    harness.add_tcp("one", echo, true);
    harness.add_tcp("two", echo, true);
    let off = harness.add_tcp("off", echo, false);

    assert_eq!(harness.manager.start_enabled().await.unwrap(), 2);
    assert!(!harness.manager.get_status(&off.id).await.is_active());
    assert_eq!(harness.manager.list_active().await.len(), 2);

    harness.manager.shutdown().await;
    assert!(harness.manager.list_active().await.is_empty());
}
