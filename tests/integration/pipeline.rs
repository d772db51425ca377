//! End-to-end pipeline tests over real sockets

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use facility_monitoring::actors::messages::{Envelope, EventType};
use facility_monitoring::actors::OfflineHandle;
use facility_monitoring::alarms::labels;
use facility_monitoring::config::{
    Condition, ConditionOp, DisplayItem, Encoding, ItemConfig, MatchMode, PatternConfig, Protocol,
    StatusConditions, SystemConfig,
};
use facility_monitoring::storage::StorageBackend;
use facility_monitoring::{Severity, Siren, SystemKind, SystemStatus};

use crate::helpers::{eventually, Stack};

pub fn threshold_config(name: &str, critical_gte: f64) -> SystemConfig {
    SystemConfig::Items(ItemConfig {
        items: vec![DisplayItem {
            name: name.to_string(),
            unit: Some("°C".into()),
            index: Some(0),
            matchers: None,
            warning: None,
            critical: None,
            conditions: Some(StatusConditions {
                warning: vec![],
                critical: vec![Condition {
                    op: ConditionOp::Gte,
                    value: Some(critical_gte),
                    text: None,
                }],
            }),
            alarm_enabled: true,
            chart_group: None,
            min: Some(0.0),
            max: Some(300.0),
        }],
        script: None,
    })
}

#[tokio::test]
async fn udp_readings_confirm_and_recover() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .add_system("sensor-1", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        client.send_to(b"150", ("127.0.0.1", stack.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    eventually("confirmed critical after three readings", || async {
        let system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
        system.status == SystemStatus::Critical
    })
    .await;

    let alarms = stack.storage.unresolved_alarms("sensor-1").await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].message, "temperature critical");
    assert_eq!(alarms[0].severity, Severity::Critical);

    for _ in 0..3 {
        client.send_to(b"70", ("127.0.0.1", stack.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    eventually("recovery after three clears", || async {
        let system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
        system.status == SystemStatus::Normal
            && stack
                .storage
                .unresolved_alarms("sensor-1")
                .await
                .unwrap()
                .is_empty()
    })
    .await;

    // History accumulated one sample per accepted reading.
    let count = stack
        .storage
        .history_count(Utc::now() - ChronoDuration::hours(1), Utc::now())
        .await
        .unwrap();
    assert_eq!(count, 6);
}

#[tokio::test]
async fn tcp_binary_frames_drive_pattern_status() {
    let stack = Stack::start(Protocol::Tcp, Encoding::Binary).await;
    stack
        .add_tcp_system(
            "line-1",
            SystemKind::Equipment,
            SystemConfig::Patterns(PatternConfig {
                critical_patterns: vec!["FAULT".into()],
                normal_patterns: vec!["OK".into()],
                match_mode: MatchMode::Contains,
            }),
        )
        .await;

    let mut stream = TcpStream::connect(("127.0.0.1", stack.port)).await.unwrap();
    // Three fixed-size frames in one write; padding is stripped.
    for _ in 0..3 {
        stream.write_all(b"FAULT LINE 3        ").await.unwrap();
    }
    stream.flush().await.unwrap();

    eventually("pattern critical confirmed from framed stream", || async {
        let system = stack.storage.get_system("line-1").await.unwrap().unwrap();
        system.status == SystemStatus::Critical
    })
    .await;

    let alarms = stack.storage.unresolved_alarms("line-1").await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].message, labels::STATUS_CRITICAL);

    let metric = stack
        .storage
        .get_metric("line-1", "status")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metric.text_value.as_deref(), Some("FAULT LINE 3"));
}

#[tokio::test]
async fn offline_detection_and_data_driven_recovery() {
    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .add_system("sensor-1", SystemKind::Sensor, SystemConfig::empty())
        .await;
    stack
        .storage
        .touch_last_data("sensor-1", Utc::now() - ChronoDuration::seconds(30))
        .await
        .unwrap();

    let offline = OfflineHandle::spawn_with_timing(
        stack.storage.clone(),
        stack.events.clone(),
        stack.alarms.clone(),
        Duration::from_millis(20),
        Duration::from_millis(500),
    );

    eventually("system marked offline", || async {
        let system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
        system.status == SystemStatus::Offline
    })
    .await;
    let alarms = stack.storage.unresolved_alarms("sensor-1").await.unwrap();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].message, labels::OFFLINE);

    // Stop the sweeps, then prove one datagram brings it back.
    offline.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"heartbeat", ("127.0.0.1", stack.port))
        .await
        .unwrap();

    eventually("recovery on first reading", || async {
        let system = stack.storage.get_system("sensor-1").await.unwrap().unwrap();
        system.status == SystemStatus::Normal
            && stack
                .storage
                .unresolved_alarms("sensor-1")
                .await
                .unwrap()
                .is_empty()
    })
    .await;
}

#[tokio::test]
async fn siren_follows_alarms_and_acknowledgement() {
    let hardware = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let hardware_port = hardware.local_addr().unwrap().port();

    let stack = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    stack
        .storage
        .upsert_siren(Siren {
            id: "siren-1".into(),
            address: "127.0.0.1".into(),
            port: hardware_port,
            protocol: Protocol::Udp,
            on_command: "ON".into(),
            off_command: Some("OFF".into()),
            enabled: true,
        })
        .await
        .unwrap();
    stack
        .add_system("sensor-1", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        client.send_to(b"150", ("127.0.0.1", stack.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut buf = [0u8; 8];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), hardware.recv_from(&mut buf))
        .await
        .expect("siren never turned on")
        .unwrap();
    assert_eq!(&buf[..n], b"ON");

    // Acknowledging the only critical alarm silences the siren.
    let alarm_id = stack.storage.unresolved_alarms("sensor-1").await.unwrap()[0]
        .id
        .clone();
    stack
        .hub
        .from_viewer(
            99,
            Envelope {
                kind: EventType::Alarm,
                data: json!({ "alarmId": alarm_id, "acknowledged": true }),
                timestamp: Utc::now(),
            },
        )
        .await;

    let (n, _) = tokio::time::timeout(Duration::from_secs(3), hardware.recv_from(&mut buf))
        .await
        .expect("siren never turned off")
        .unwrap();
    assert_eq!(&buf[..n], b"OFF");
}

#[tokio::test]
async fn two_systems_on_different_ports_stay_independent() {
    let stack_a = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    let stack_b = Stack::start(Protocol::Udp, Encoding::Utf8).await;
    assert_ne!(stack_a.port, stack_b.port);

    stack_a
        .add_system("sensor-a", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;
    stack_b
        .add_system("sensor-b", SystemKind::Sensor, threshold_config("temperature", 100.0))
        .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..3 {
        client.send_to(b"150", ("127.0.0.1", stack_a.port)).await.unwrap();
        client.send_to(b"50", ("127.0.0.1", stack_b.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    eventually("only the loaded system trips", || async {
        let a = stack_a.storage.get_system("sensor-a").await.unwrap().unwrap();
        a.status == SystemStatus::Critical
    })
    .await;

    let b = stack_b.storage.get_system("sensor-b").await.unwrap().unwrap();
    assert_eq!(b.status, SystemStatus::Normal);
    assert!(stack_b.storage.unresolved_alarms("sensor-b").await.unwrap().is_empty());
}
