//! Offline detector
//!
//! Periodic sweep over all active systems. A system whose last reading
//! is older than the threshold is marked offline and gets a
//! communication-lost alarm; the severity depends on what the system
//! monitors. Recovery is handled by the updater when data arrives
//! again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::alarms::{labels, AlarmManager};
use crate::actors::messages::Envelope;
use crate::storage::StorageBackend;
use crate::{Severity, SystemKind, SystemStatus};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const OFFLINE_THRESHOLD: Duration = Duration::from_secs(60);

pub struct OfflineDetector {
    storage: Arc<dyn StorageBackend>,
    events: tokio::sync::broadcast::Sender<Envelope>,
    alarms: AlarmManager,

    stop: mpsc::Receiver<()>,
    interval: Duration,
    threshold: chrono::Duration,
}

impl OfflineDetector {
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting offline detector");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("offline sweep failed: {e}");
                    }
                }
                _ = self.stop.recv() => break,
            }
        }

        debug!("offline detector stopped");
    }

    async fn sweep(&self) -> crate::storage::StorageResult<()> {
        let cutoff = Utc::now() - self.threshold;

        for system in self.storage.active_systems().await? {
            if system.status == SystemStatus::Offline {
                continue;
            }
            // A system that never reported has no baseline to go stale.
            let Some(last_data) = system.last_data else {
                continue;
            };
            if last_data >= cutoff {
                continue;
            }

            debug!(
                "system {} went offline (last data {last_data})",
                system.id
            );

            self.storage
                .update_system_status(&system.id, SystemStatus::Offline)
                .await?;

            let mut updated = system.clone();
            updated.status = SystemStatus::Offline;
            let _ = self.events.send(Envelope::system(&updated));

            // Losing a UPS is worse than losing a sensor.
            let severity = match system.kind {
                SystemKind::Ups => Severity::Critical,
                SystemKind::Equipment | SystemKind::Sensor => Severity::Warning,
            };
            self.alarms
                .raise(&system.id, severity, labels::OFFLINE, None)
                .await?;
        }

        Ok(())
    }
}

/// Handle for the offline detector
#[derive(Clone)]
pub struct OfflineHandle {
    stop: mpsc::Sender<()>,
}

impl OfflineHandle {
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        events: tokio::sync::broadcast::Sender<Envelope>,
        alarms: AlarmManager,
    ) -> Self {
        Self::spawn_with_timing(storage, events, alarms, SWEEP_INTERVAL, OFFLINE_THRESHOLD)
    }

    /// Spawn with explicit timing, mainly for short-interval tests.
    pub fn spawn_with_timing(
        storage: Arc<dyn StorageBackend>,
        events: tokio::sync::broadcast::Sender<Envelope>,
        alarms: AlarmManager,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);

        let detector = OfflineDetector {
            storage,
            events,
            alarms,
            stop: rx,
            interval,
            threshold: chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        };
        tokio::spawn(detector.run());

        Self { stop: tx }
    }

    pub async fn shutdown(&self) {
        let _ = self.stop.send(()).await;
    }
}
