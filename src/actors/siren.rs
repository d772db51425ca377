//! Siren synchronizer actor
//!
//! Derives the desired audible state from storage (any unresolved,
//! unacknowledged critical alarm, unless muted) and pushes on/off
//! commands to the configured siren hardware. The actor keeps an
//! `active` flag so repeated reconciles with no change send nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, trace, warn};

use crate::config::Protocol;
use crate::storage::StorageBackend;
use crate::Siren;

use super::messages::{Envelope, SirenMessage};

const TCP_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Actor that keeps physical sirens in sync with alarm state
pub struct SirenActor {
    storage: Arc<dyn StorageBackend>,

    /// Event bus, used to announce siren state changes to viewers
    events: broadcast::Sender<Envelope>,

    receiver: mpsc::Receiver<SirenMessage>,

    /// Last state pushed to the hardware
    active: bool,
}

impl SirenActor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        events: broadcast::Sender<Envelope>,
        receiver: mpsc::Receiver<SirenMessage>,
    ) -> Self {
        Self {
            storage,
            events,
            receiver,
            active: false,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting siren actor");

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                SirenMessage::Reconcile => self.reconcile().await,
                SirenMessage::Silence => self.silence().await,
            }
        }

        debug!("siren actor stopped");
    }

    /// Re-derive the desired siren state and push it out if it changed.
    async fn reconcile(&mut self) {
        let desired = match self.desired_state().await {
            Ok(desired) => desired,
            Err(e) => {
                warn!("failed to derive siren state: {e}");
                return;
            }
        };

        if desired == self.active {
            trace!("siren state unchanged (active = {desired})");
            return;
        }

        debug!("siren state changed: {} -> {desired}", self.active);
        self.send_to_all(desired).await;
        self.active = desired;

        let _ = self.events.send(Envelope::siren_sync(desired));
    }

    /// Best-effort off command to every siren. Used at shutdown so
    /// hardware is not left wailing when the process exits.
    async fn silence(&mut self) {
        debug!("silencing all sirens");
        self.send_to_all(false).await;
        self.active = false;
    }

    async fn desired_state(&self) -> crate::storage::StorageResult<bool> {
        let settings = self.storage.settings().await?;
        if settings.is_muted(Utc::now()) {
            return Ok(false);
        }

        let unacked = self.storage.count_unacked_critical().await?;
        Ok(unacked > 0)
    }

    async fn send_to_all(&self, on: bool) {
        let sirens = match self.storage.sirens().await {
            Ok(sirens) => sirens,
            Err(e) => {
                warn!("failed to load sirens: {e}");
                return;
            }
        };

        for siren in sirens.iter().filter(|s| s.enabled) {
            let Some(command) = Self::command_for(siren, on) else {
                trace!("siren {} has no off command, skipping", siren.id);
                continue;
            };

            if let Err(e) = Self::send_command(siren, command).await {
                warn!("failed to command siren {}: {e}", siren.id);
            }
        }
    }

    fn command_for(siren: &Siren, on: bool) -> Option<&str> {
        if on {
            Some(siren.on_command.as_str())
        } else {
            siren.off_command.as_deref()
        }
    }

    async fn send_command(siren: &Siren, command: &str) -> std::io::Result<()> {
        let target = format!("{}:{}", siren.address, siren.port);
        trace!("sending {command:?} to siren at {target}");

        match siren.protocol {
            Protocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.send_to(command.as_bytes(), &target).await?;
            }
            Protocol::Tcp => {
                let send = async {
                    let mut stream = TcpStream::connect(&target).await?;
                    stream.write_all(command.as_bytes()).await?;
                    stream.shutdown().await
                };
                tokio::time::timeout(TCP_SEND_TIMEOUT, send)
                    .await
                    .map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "siren send timed out")
                    })??;
            }
        }

        Ok(())
    }
}

/// Handle for the siren actor
#[derive(Clone)]
pub struct SirenHandle {
    sender: mpsc::Sender<SirenMessage>,
}

impl SirenHandle {
    pub fn spawn(storage: Arc<dyn StorageBackend>, events: broadcast::Sender<Envelope>) -> Self {
        let (tx, rx) = mpsc::channel(32);

        let actor = SirenActor::new(storage, events, rx);
        tokio::spawn(actor.run());

        Self { sender: tx }
    }

    /// Ask the actor to re-derive and apply the siren state.
    pub async fn reconcile(&self) {
        let _ = self.sender.send(SirenMessage::Reconcile).await;
    }

    /// Best-effort off command to all sirens.
    pub async fn silence(&self) {
        let _ = self.sender.send(SirenMessage::Silence).await;
    }
}
