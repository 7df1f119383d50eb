//! Orchestrator lifecycle tests against real `/bin/sh` workers.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use lift_id::WorkerId;
use lift_manager::brain::{Brain, BrainError, BrainParams, ProcessClass, ReapReason};
use lift_manager::heartbeat::ChannelConnection;
use lift_manager::registry::{Registry, RegistryError};
use lift_manager::worker::MonitoringStatus;
use lift_networking::{Port, PortError, PortPoolParams};
use lift_proto::{ErrorCode, HeartbeatMessage};

fn sh_class(name: &str, index: usize, script: &str, capacity: i64) -> ProcessClass {
    ProcessClass {
        name: name.to_string(),
        index,
        executable: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), name.to_string()],
        capacity,
        max_backfill_secs: 600,
    }
}

fn params(capacity: u16, min_wait: Duration) -> BrainParams {
    BrainParams {
        classes: vec![
            sh_class("arena", 0, "sleep 30", 4),
            sh_class("flash", 1, "exit 0", 4),
        ],
        worker_listen_address: "127.0.0.1".to_string(),
        heartbeat_timeout: Duration::from_secs(5),
        ports: PortPoolParams {
            start_from: 7777,
            capacity,
        },
        sweep_interval: Duration::from_secs(3600),
        minimum_wait_for_close: min_wait,
    }
}

fn brain(capacity: u16, min_wait: Duration) -> Brain {
    Brain::new(params(capacity, min_wait), Arc::new(Registry::new())).unwrap()
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_launch_then_shutdown_returns_port() {
    let brain = brain(2, Duration::from_secs(60));

    let launched = brain.launch(0).unwrap();
    assert_eq!(launched.port, Port::new(7777));
    assert_eq!(brain.registry().count(), 1);
    assert!(brain.port_pool().is_in_use(launched.port));
    assert_eq!(brain.port_pool().info().current_capacity, 1);

    brain.shutdown(launched.id).unwrap();
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);

    assert!(!brain.port_pool().is_in_use(launched.port));
    assert_eq!(brain.port_pool().info().current_capacity, 2);
    assert!(matches!(
        brain.shutdown(launched.id),
        Err(BrainError::NotFound(id)) if id == launched.id
    ));
}

#[tokio::test]
async fn test_shutdown_is_idempotent_while_registered() {
    let brain = brain(2, Duration::from_secs(60));
    let launched = brain.launch(0).unwrap();

    brain.shutdown(launched.id).unwrap();
    // Either still closing (Ok) or already reclaimed (NotFound).
    match brain.shutdown(launched.id) {
        Ok(()) | Err(BrainError::NotFound(_)) => {}
        Err(e) => panic!("unexpected error: {e}"),
    }
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_out_of_range_allocates_nothing() {
    let brain = brain(2, Duration::from_secs(60));
    let before = brain.port_pool().info();

    assert!(matches!(
        brain.launch(2),
        Err(BrainError::IndexOutOfRange { index: 2, count: 2 })
    ));
    assert!(matches!(
        brain.backfill_list(7),
        Err(BrainError::IndexOutOfRange { index: 7, count: 2 })
    ));

    assert_eq!(brain.port_pool().info(), before);
    assert_eq!(brain.registry().count(), 0);
}

#[tokio::test]
async fn test_port_exhaustion() {
    let brain = brain(2, Duration::from_secs(60));

    let a = brain.launch(0).unwrap();
    let b = brain.launch(0).unwrap();
    assert_ne!(a.port, b.port);
    assert!(matches!(
        brain.launch(0),
        Err(BrainError::Port(PortError::Exhausted))
    ));

    brain.shutdown_all();
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
    assert_eq!(brain.port_pool().info().current_capacity, 2);
}

#[tokio::test]
async fn test_self_exiting_worker_is_reclaimed() {
    let brain = brain(1, Duration::from_secs(60));

    let launched = brain.launch(1).unwrap();
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
    assert!(!brain.port_pool().is_in_use(launched.port));

    // The freed port is reusable.
    let again = brain.launch(1).unwrap();
    assert_eq!(again.port, launched.port);
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_port_is_free_only_after_registry_removal() {
    let brain = brain(1, Duration::from_secs(60));

    for _ in 0..25 {
        let launched = brain.launch(1).unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while brain.port_pool().is_in_use(launched.port) {
                tokio::task::yield_now().await;
            }
            assert!(matches!(
                brain.registry().item(&launched.id),
                Err(RegistryError::NotFound(id)) if id == launched.id
            ));
        })
        .await
        .unwrap();

        assert_eq!(brain.registry().count(), 0);
    }
}

#[tokio::test]
async fn test_failed_start_returns_port() {
    let mut params = params(1, Duration::from_secs(60));
    params.classes[0].executable = "/nonexistent/lift-worker".to_string();
    let brain = Brain::new(params, Arc::new(Registry::new())).unwrap();

    assert!(matches!(brain.launch(0), Err(BrainError::Process(_))));
    assert_eq!(brain.registry().count(), 0);
    assert_eq!(brain.port_pool().info().current_capacity, 1);
}

#[tokio::test]
async fn test_heartbeat_feeds_worker_info() {
    let brain = brain(2, Duration::from_secs(60));
    let launched = brain.launch(0).unwrap();

    let (tx, conn) = ChannelConnection::pair(8);
    brain.connect(launched.id, conn).unwrap();

    let (_second_tx, second) = ChannelConnection::pair(8);
    assert!(matches!(
        brain.connect(launched.id, second),
        Err(BrainError::AlreadyConnected(id)) if id == launched.id
    ));
    assert!(matches!(
        brain.ensure_connectable(launched.id),
        Err(BrainError::AlreadyConnected(_))
    ));

    tx.send(HeartbeatMessage::report(&launched.id, 3, 2, 1))
        .await
        .unwrap();
    let registry = Arc::clone(brain.registry());
    eventually("heartbeat applied", || {
        registry
            .item(&launched.id)
            .map(|w| w.summary().connection_count == 3)
            .unwrap_or(false)
    })
    .await;

    let all = brain.registry().unsorted_info();
    assert_eq!(all.count, 1);
    let info = &all.infos[0];
    assert_eq!(info.summary.status, MonitoringStatus::Ok);
    assert_eq!(info.summary.session_count, 2);
    assert_eq!(info.summary.active_session_count, 1);

    let report = brain.sweep_once();
    assert_eq!(report.before, 1);
    assert_eq!(report.after, 1);
    assert!(report.reaped.is_empty());
    assert_eq!(report.total_connections, 3);
    assert_eq!(report.total_sessions, 2);
    assert_eq!(report.total_active_sessions, 1);

    brain.shutdown_all();
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
    assert!(tx.is_closed());
}

#[tokio::test]
async fn test_connect_unknown_worker() {
    let brain = brain(1, Duration::from_secs(60));
    let (_tx, conn) = ChannelConnection::pair(1);
    let id = WorkerId::new();
    assert!(matches!(brain.connect(id, conn), Err(BrainError::NotFound(found)) if found == id));
    assert!(matches!(brain.ensure_connectable(id), Err(BrainError::NotFound(_))));
}

#[tokio::test]
async fn test_sweep_reaps_never_established_worker() {
    let brain = brain(2, Duration::from_millis(200));
    let launched = brain.launch(0).unwrap();

    let report = brain.sweep_once();
    assert!(report.reaped.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = brain.sweep_once();
    assert_eq!(report.before, 1);
    assert_eq!(report.after, 0);
    assert_eq!(report.reaped.len(), 1);
    assert_eq!(report.reaped[0].id, launched.id);
    assert_eq!(report.reaped[0].reason, ReapReason::NeverEstablished);

    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
    assert_eq!(brain.port_pool().info().current_capacity, 2);
}

#[tokio::test]
async fn test_sweep_reaps_fatal_worker_and_skips_unknown_counts() {
    let brain = brain(2, Duration::from_secs(60));
    let launched = brain.launch(0).unwrap();

    let (tx, conn) = ChannelConnection::pair(8);
    brain.connect(launched.id, conn).unwrap();
    tx.send(
        HeartbeatMessage::report(&launched.id, 0, 0, 0).with_error(ErrorCode::Fatal, "crashed"),
    )
    .await
    .unwrap();

    let registry = Arc::clone(brain.registry());
    eventually("fatal flag", || {
        registry
            .item(&launched.id)
            .map(|w| w.is_fatal())
            .unwrap_or(false)
    })
    .await;

    let report = brain.sweep_once();
    assert_eq!(report.reaped.len(), 1);
    assert_eq!(report.reaped[0].reason, ReapReason::Fatal);
    assert_eq!(report.total_connections, 0);
    assert_eq!(report.total_sessions, 0);

    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_backfill_through_brain() {
    let brain = brain(4, Duration::from_secs(60));
    let full = brain.launch(0).unwrap();
    let partial = brain.launch(0).unwrap();
    let empty = brain.launch(0).unwrap();

    let mut senders = Vec::new();
    for (worker, connections) in [(full, 4), (partial, 3), (empty, 0)] {
        let (tx, conn) = ChannelConnection::pair(8);
        brain.connect(worker.id, conn).unwrap();
        tx.send(HeartbeatMessage::report(&worker.id, connections, 0, connections))
            .await
            .unwrap();
        let registry = Arc::clone(brain.registry());
        eventually("heartbeat applied", || {
            registry
                .item(&worker.id)
                .map(|w| w.summary().time_last_communicate.is_some())
                .unwrap_or(false)
        })
        .await;
        senders.push(tx);
    }

    let ranked = brain.backfill_list(0).unwrap();
    let ids: Vec<WorkerId> = ranked.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![partial.id, empty.id]);
    assert_eq!(ranked[0].port, partial.port);
    assert_eq!(ranked[0].active_session_count, 3);

    assert!(brain.backfill_list(1).unwrap().is_empty());

    brain.shutdown_all();
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_sweeper_stops_on_shutdown_signal() {
    let mut params = params(1, Duration::from_millis(100));
    params.sweep_interval = Duration::from_millis(50);
    let brain = Brain::new(params, Arc::new(Registry::new())).unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = brain.spawn_sweeper(shutdown_rx);

    brain.launch(0).unwrap();
    assert!(brain.wait_until_empty(Duration::from_secs(10)).await);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
