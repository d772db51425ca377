//! Network listeners for incoming telemetry
//!
//! One listener task per configured port. Listeners never die on
//! socket errors: bind failures and receive errors put the task into a
//! doubling backoff and it tries again, so a port blocked at startup
//! recovers once it frees up.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::actors::messages::{Envelope, RawReading};
use crate::actors::updater::UpdaterHandle;
use crate::config::{Config, PortConfig, Protocol};
use crate::parser::Reading;

pub mod tcp;
pub mod udp;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Doubling retry delay, reset after a successful bind.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    /// Returns the delay to sleep for and doubles the next one.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn one listener task per configured port.
pub fn spawn_listeners(
    config: &Config,
    bind_addr: &str,
    updater: UpdaterHandle,
    events: broadcast::Sender<Envelope>,
) -> Vec<JoinHandle<()>> {
    config
        .ports
        .iter()
        .map(|port| {
            info!(
                "starting {:?} listener on {bind_addr}:{} ({})",
                port.protocol, port.port, port.label
            );
            match port.protocol {
                Protocol::Udp => {
                    udp::spawn(bind_addr.to_string(), port.clone(), updater.clone(), events.clone())
                }
                Protocol::Tcp => {
                    tcp::spawn(bind_addr.to_string(), port.clone(), updater.clone(), events.clone())
                }
            }
        })
        .collect()
}

/// Mirror a reading to viewers, then hand it to the pipeline. The raw
/// mirror always happens, even for traffic no system will match.
pub(crate) async fn emit(
    config: &PortConfig,
    reading: Reading,
    updater: &UpdaterHandle,
    events: &broadcast::Sender<Envelope>,
) {
    let _ = events.send(Envelope::raw(config.port, &reading.text));

    updater
        .ingest(RawReading {
            port: config.port,
            protocol: config.protocol,
            reading,
        })
        .await;
}
