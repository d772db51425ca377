//! Push hub actor
//!
//! Owns the viewer registry. Every event on the bus is fanned out to
//! all connected viewers with `try_send`; a viewer that cannot keep up
//! loses events rather than stalling the pipeline.
//!
//! Events sent upstream by a viewer are applied to storage where they
//! have a domain effect (delete, acknowledge, settings) and relayed to
//! the viewer's peers so every open view converges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, trace, warn};

use crate::storage::StorageBackend;
use crate::Settings;

use super::messages::{Envelope, EventType, HubMessage};
use super::siren::SirenHandle;
use super::updater::UpdaterHandle;

const VIEWER_QUEUE: usize = 64;

/// Actor that fans events out to connected viewers
pub struct HubActor {
    storage: Arc<dyn StorageBackend>,
    updater: UpdaterHandle,
    siren: SirenHandle,

    receiver: mpsc::Receiver<HubMessage>,
    events: broadcast::Receiver<Envelope>,

    viewers: HashMap<u64, mpsc::Sender<Envelope>>,
}

impl HubActor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        updater: UpdaterHandle,
        siren: SirenHandle,
        receiver: mpsc::Receiver<HubMessage>,
        events: broadcast::Receiver<Envelope>,
    ) -> Self {
        Self {
            storage,
            updater,
            siren,
            receiver,
            events,
            viewers: HashMap::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting hub actor");

        loop {
            tokio::select! {
                result = self.events.recv() => {
                    match result {
                        Ok(envelope) => self.fan_out(&envelope, None),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("hub lagged, skipped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("event bus closed, shutting down");
                            break;
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(HubMessage::Register { id, tx }) => {
                            debug!("viewer {id} connected ({} total)", self.viewers.len() + 1);
                            // Greet so the viewer knows the channel is live.
                            let _ = tx.try_send(Envelope::ping());
                            self.viewers.insert(id, tx);
                        }
                        Some(HubMessage::Unregister { id }) => {
                            self.viewers.remove(&id);
                            debug!("viewer {id} disconnected ({} left)", self.viewers.len());
                        }
                        Some(HubMessage::FromViewer { viewer, envelope }) => {
                            self.handle_viewer_event(viewer, envelope).await;
                        }
                        None => {
                            debug!("hub handle dropped, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("hub actor stopped");
    }

    /// Deliver an envelope to every viewer except `skip`.
    fn fan_out(&mut self, envelope: &Envelope, skip: Option<u64>) {
        let mut dead = Vec::new();

        for (&id, tx) in &self.viewers {
            if Some(id) == skip {
                continue;
            }
            match tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("viewer {id} is slow, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.viewers.remove(&id);
            debug!("pruned dead viewer {id}");
        }
    }

    async fn handle_viewer_event(&mut self, viewer: u64, envelope: Envelope) {
        match envelope.kind {
            EventType::Delete => {
                let Some(system_id) = envelope.data["systemId"].as_str().map(String::from) else {
                    warn!("delete event from viewer {viewer} without systemId");
                    return;
                };
                debug!("viewer {viewer} deleted system {system_id}");

                if let Err(e) = self.storage.delete_system(&system_id).await {
                    warn!("failed to delete system {system_id}: {e}");
                    return;
                }
                self.updater.system_deleted(system_id).await;
                self.siren.reconcile().await;
            }

            EventType::Alarm => {
                let Some(alarm_id) = envelope.data["alarmId"].as_str() else {
                    warn!("alarm event from viewer {viewer} without alarmId");
                    return;
                };
                debug!("viewer {viewer} acknowledged alarm {alarm_id}");

                if let Err(e) = self.storage.acknowledge_alarm(alarm_id).await {
                    warn!("failed to acknowledge alarm {alarm_id}: {e}");
                    return;
                }
                self.siren.reconcile().await;
            }

            EventType::Settings => {
                let settings: Settings = match serde_json::from_value(envelope.data.clone()) {
                    Ok(settings) => settings,
                    Err(e) => {
                        warn!("bad settings payload from viewer {viewer}: {e}");
                        return;
                    }
                };
                debug!("viewer {viewer} updated settings");

                if let Err(e) = self.storage.update_settings(settings).await {
                    warn!("failed to update settings: {e}");
                    return;
                }
                self.siren.reconcile().await;
            }

            // A viewer asking for a sync forces an immediate reconcile;
            // the resulting state comes back over the bus.
            EventType::SirenSync => {
                debug!("viewer {viewer} requested a siren sync");
                self.siren.reconcile().await;
                return;
            }

            other => {
                trace!("ignoring {other:?} event from viewer {viewer}");
                return;
            }
        }

        // Peers see the mutation; the originator already applied it.
        self.fan_out(&envelope, Some(viewer));
    }
}

/// Handle for the push hub
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubMessage>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        updater: UpdaterHandle,
        siren: SirenHandle,
        events: broadcast::Receiver<Envelope>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);

        let actor = HubActor::new(storage, updater, siren, rx, events);
        tokio::spawn(actor.run());

        Self {
            sender: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new viewer; returns its id and the event stream.
    pub async fn register(&self) -> (u64, mpsc::Receiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let _ = self.sender.send(HubMessage::Register { id, tx }).await;
        (id, rx)
    }

    pub async fn unregister(&self, id: u64) {
        let _ = self.sender.send(HubMessage::Unregister { id }).await;
    }

    /// Hand an event a viewer sent upstream to the hub.
    pub async fn from_viewer(&self, viewer: u64, envelope: Envelope) {
        let _ = self
            .sender
            .send(HubMessage::FromViewer { viewer, envelope })
            .await;
    }
}
