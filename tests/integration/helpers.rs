//! Shared fixtures for the integration tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use facility_monitoring::actors::messages::Envelope;
use facility_monitoring::actors::{HubHandle, SirenHandle, UpdaterHandle};
use facility_monitoring::alarms::AlarmManager;
use facility_monitoring::config::{Encoding, PortConfig, Protocol, SystemConfig};
use facility_monitoring::listeners::{tcp, udp};
use facility_monitoring::storage::{MemoryBackend, StorageBackend};
use facility_monitoring::{System, SystemKind, SystemStatus};

/// A full in-process stack: storage, actors, hub, and one listener.
pub struct Stack {
    pub storage: Arc<MemoryBackend>,
    pub events: broadcast::Sender<Envelope>,
    pub updater: UpdaterHandle,
    pub siren: SirenHandle,
    pub alarms: AlarmManager,
    pub hub: HubHandle,
    pub port: u16,
    _listener: JoinHandle<()>,
}

impl Stack {
    pub async fn start(protocol: Protocol, encoding: Encoding) -> Self {
        let port = match protocol {
            Protocol::Udp => free_udp_port(),
            Protocol::Tcp => free_tcp_port(),
        };

        let storage = Arc::new(MemoryBackend::new());
        let (events, _) = broadcast::channel(256);

        let siren = SirenHandle::spawn(storage.clone(), events.clone());
        let alarms = AlarmManager::new(storage.clone(), events.clone(), siren.clone());
        let updater = UpdaterHandle::spawn(storage.clone(), events.clone(), alarms);
        let hub = HubHandle::spawn(
            storage.clone(),
            updater.clone(),
            siren.clone(),
            events.subscribe(),
        );

        let config = PortConfig {
            port,
            protocol,
            label: "test".into(),
            kind: SystemKind::Sensor,
            encoding,
        };
        let listener = match protocol {
            Protocol::Udp => udp::spawn("127.0.0.1".into(), config, updater.clone(), events.clone()),
            Protocol::Tcp => tcp::spawn("127.0.0.1".into(), config, updater.clone(), events.clone()),
        };
        // Give the listener time to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let alarms = AlarmManager::new(storage.clone(), events.clone(), siren.clone());
        Self {
            storage,
            events,
            updater,
            siren,
            alarms,
            hub,
            port,
            _listener: listener,
        }
    }

    pub async fn add_system(&self, id: &str, kind: SystemKind, config: SystemConfig) {
        self.storage
            .upsert_system(System {
                id: id.to_string(),
                name: id.to_string(),
                kind,
                port: self.port,
                protocol: Protocol::Udp,
                enabled: true,
                active: true,
                config,
                last_data: None,
                status: SystemStatus::Normal,
            })
            .await
            .unwrap();
    }

    pub async fn add_tcp_system(&self, id: &str, kind: SystemKind, config: SystemConfig) {
        self.storage
            .upsert_system(System {
                id: id.to_string(),
                name: id.to_string(),
                kind,
                port: self.port,
                protocol: Protocol::Tcp,
                enabled: true,
                active: true,
                config,
                last_data: None,
                status: SystemStatus::Normal,
            })
            .await
            .unwrap();
    }
}

pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait until `probe` returns true or the deadline passes.
pub async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
