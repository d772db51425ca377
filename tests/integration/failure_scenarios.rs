//! Hostile and degraded input scenarios

use std::time::Duration;

use tokio::net::UdpSocket;

use facility_monitoring::config::{Encoding, Protocol, SystemConfig};
use facility_monitoring::storage::StorageBackend;
use facility_monitoring::{SystemKind, SystemStatus};

use crate::helpers::{eventually, Stack};
use crate::pipeline::threshold_config;

#[tokio::test]
async fn garbage_bytes_do_not_poison_the_pipeline() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .add_system("sensor-1", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // Invalid UTF-8, control bytes, oversized junk: none of it may kill
    // the listener or the worker.
    client
        .send_to(&[0xff, 0xfe, 0x00, 0x01], ("127.0.0.1", stack.port))
        .await
        .unwrap();
    client
        .send_to(&[0xf0; 1500], ("127.0.0.1", stack.port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Valid readings afterwards still work end to end.
    for _ in 0..3 {
        client.send_to(b"150", ("127.0.0.1", stack.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    eventually("pipeline still functions after garbage", || async {
        let system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
        system.status == SystemStatus::Critical
    })
    .await;
}

#[tokio::test]
async fn disabled_system_receives_nothing() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .add_system("sensor-1", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;

    let mut system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
    system.enabled = false;
    stack.storage.upsert_system(system).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        client.send_to(b"150", ("127.0.0.1", stack.port)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
    assert_eq!(system.status, SystemStatus::Normal);
    assert!(system.last_data.is_none());
    assert!(stack.storage.get_metric("sensor-1", "temperature").await.unwrap().is_none());
}

#[tokio::test]
async fn slow_viewer_does_not_stall_processing() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .add_system("sensor-1", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;

    // Register a viewer and never read from it.
    let (_viewer, _rx) = stack.hub.register().await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..200 {
        client.send_to(b"42", ("127.0.0.1", stack.port)).await.unwrap();
    }

    eventually("metrics keep flowing past a stuck viewer", || async {
        stack
            .storage
            .get_metric("sensor-1", "temperature")
            .await
            .unwrap()
            .is_some_and(|m| m.value == Some(42.0))
    })
    .await;
}

#[tokio::test]
async fn unconfigured_port_traffic_is_dropped() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    // No system registered at all.

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"150", ("127.0.0.1", stack.port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(stack.storage.active_systems().await.unwrap().is_empty());
}

#[tokio::test]
async fn unrecognized_config_shape_updates_liveness_only() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .add_system("mystery-1", SystemKind::Equipment, SystemConfig::empty())
        .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"anything at all", ("127.0.0.1", stack.port))
        .await
        .unwrap();

    eventually("liveness updated", || async {
        let system = stack.storage.get_system("mystery-1").await.unwrap().unwrap();
        system.last_data.is_some()
    })
    .await;

    let system = stack.storage.get_system("mystery-1").await.unwrap().unwrap();
    assert_eq!(system.status, SystemStatus::Normal);
    assert!(stack.storage.unresolved_alarms("mystery-1").await.unwrap().is_empty());
}
