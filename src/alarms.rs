//! Alarm lifecycle management
//!
//! All alarm creation and resolution goes through [`AlarmManager`] so
//! the invariant holds everywhere: at most one unresolved alarm per
//! (system, message) pair. Every mutation is logged, announced on the
//! event bus, and followed by a siren reconcile.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};

use crate::actors::messages::Envelope;
use crate::actors::siren::SirenHandle;
use crate::storage::{StorageBackend, StorageResult};
use crate::{Alarm, Severity};

/// Stable alarm messages. Resolution matches on these strings, so they
/// must not carry readings or timestamps.
pub mod labels {
    pub const OFFLINE: &str = "communication lost";
    pub const STATUS_CRITICAL: &str = "critical status reported";

    pub fn item_critical(name: &str) -> String {
        format!("{name} critical")
    }

    pub fn item_warning(name: &str) -> String {
        format!("{name} warning")
    }
}

#[derive(Clone)]
pub struct AlarmManager {
    storage: Arc<dyn StorageBackend>,
    events: broadcast::Sender<Envelope>,
    siren: SirenHandle,
}

impl AlarmManager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        events: broadcast::Sender<Envelope>,
        siren: SirenHandle,
    ) -> Self {
        Self {
            storage,
            events,
            siren,
        }
    }

    /// Raise an alarm unless one with the same message is already open
    /// for this system. Returns the new alarm, or `None` when the
    /// existing one made this a no-op.
    #[instrument(skip(self, value))]
    pub async fn raise(
        &self,
        system_id: &str,
        severity: Severity,
        message: &str,
        value: Option<String>,
    ) -> StorageResult<Option<Alarm>> {
        if self
            .storage
            .find_unresolved_alarm(system_id, message)
            .await?
            .is_some()
        {
            trace!("alarm already open, not duplicating");
            return Ok(None);
        }

        let alarm = self
            .storage
            .create_alarm(system_id, severity, message, value)
            .await?;
        self.storage.append_alarm_log(&alarm.id, "raised").await?;

        debug!("raised {severity:?} alarm: {message}");

        let name = self.system_name(system_id).await?;
        let _ = self.events.send(Envelope::alarm(&alarm, &name));
        self.siren.reconcile().await;

        Ok(Some(alarm))
    }

    /// Display name for envelopes; falls back to the id when the system
    /// row is already gone.
    async fn system_name(&self, system_id: &str) -> StorageResult<String> {
        Ok(self
            .storage
            .get_system(system_id)
            .await?
            .map(|s| s.name)
            .unwrap_or_else(|| system_id.to_string()))
    }

    /// Resolve the open alarm with this exact message, if any.
    pub async fn resolve_message(
        &self,
        system_id: &str,
        message: &str,
    ) -> StorageResult<Vec<String>> {
        let Some(alarm) = self
            .storage
            .find_unresolved_alarm(system_id, message)
            .await?
        else {
            return Ok(Vec::new());
        };

        self.resolve(system_id, Some(&[alarm.id])).await
    }

    /// Resolve every open alarm for a system.
    pub async fn resolve_all(&self, system_id: &str) -> StorageResult<Vec<String>> {
        self.resolve(system_id, None).await
    }

    #[instrument(skip(self, ids))]
    async fn resolve(&self, system_id: &str, ids: Option<&[String]>) -> StorageResult<Vec<String>> {
        let resolved = self.storage.resolve_alarms(system_id, ids).await?;
        if resolved.is_empty() {
            return Ok(resolved);
        }

        for id in &resolved {
            self.storage.append_alarm_log(id, "resolved").await?;
        }

        debug!("resolved {} alarm(s)", resolved.len());

        let name = self.system_name(system_id).await?;
        let _ = self.events.send(Envelope::alarm_resolved(system_id, &name, &resolved));
        self.siren.reconcile().await;

        Ok(resolved)
    }
}
