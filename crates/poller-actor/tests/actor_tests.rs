mod common;

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use common::FakeGateway;
use modbus_client::ClientConfig;
use poller_actor::{ActorConfig, PollerActor, PollerError};
use register_map::{RegisterMap, SlaveAssignment, TOTAL_PV_POWER};
use types::DeviceIdentity;

fn actor(
    sender: mpsc::Sender<poller_actor::Snapshot>,
    shutdown: watch::Receiver<bool>,
) -> PollerActor {
    PollerActor::new(
        DeviceIdentity {
            host: "127.0.0.1".to_string(),
            port: 502,
        },
        ClientConfig::default(),
        RegisterMap::builtin(&SlaveAssignment::default()),
        sender,
        shutdown,
        ActorConfig {
            poll_interval: Duration::from_millis(10),
            ..ActorConfig::default()
        },
    )
}

#[tokio::test]
async fn actor_emits_snapshots_until_shutdown() {
    let (tx, mut rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = FakeGateway::new();
    gateway.populate_cerbo();

    let handle = tokio::spawn(actor(tx, shutdown_rx).run_with_source(gateway));

    let first = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first snapshot in time")
        .expect("channel open");
    assert!(first.success);
    assert_eq!(first.cycle, 0);
    assert_eq!(first.value(TOTAL_PV_POWER), Some(1234.0));

    let second = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("second snapshot in time")
        .expect("channel open");
    assert_eq!(second.cycle, 1);

    shutdown_tx.send(true).expect("shutdown");
    let result = timeout(Duration::from_secs(2), handle)
        .await
        .expect("actor stops")
        .expect("join");
    assert!(result.is_ok());
}

#[tokio::test]
async fn failed_first_refresh_stops_the_actor() {
    let (tx, _rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = FakeGateway::new();
    gateway.set_link_down(true);
    gateway.set_reconnect_fails(true);

    let result = actor(tx, shutdown_rx).run_with_source(gateway).await;
    assert!(matches!(result, Err(PollerError::Reconnect(_))));
}

#[tokio::test]
async fn later_failures_are_reported_as_unsuccessful_snapshots() {
    let (tx, mut rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = std::sync::Arc::new(FakeGateway::new());
    gateway.populate_cerbo();

    let handle = tokio::spawn(actor(tx, shutdown_rx).run_with_source(gateway.clone()));

    let first = rx.recv().await.expect("first");
    assert!(first.success);

    gateway.set_link_down(true);
    gateway.set_reconnect_fails(true);
    let failed = loop {
        let snapshot = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("snapshot in time")
            .expect("channel open");
        if !snapshot.success {
            break snapshot;
        }
    };
    assert!(failed.readings.values.is_empty());
    assert!(failed.error.is_some());

    shutdown_tx.send(true).expect("shutdown");
    let _ = timeout(Duration::from_secs(2), handle).await.expect("actor stops");
}
