//! Updater actor - routes readings to per-system workers
//!
//! The actor itself only routes: each reading is matched to the systems
//! registered on its (port, protocol) and forwarded to that system's
//! worker task. Every worker owns its own queue plus all mutable
//! evaluation state (hysteresis counters, spike filters, trend memory),
//! so readings for one system are processed strictly in arrival order
//! while different systems proceed in parallel.
//!
//! Deleting a system drops its worker sender; the worker drains and
//! exits, taking the in-memory state with it. A re-created system
//! starts from a fresh worker.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, trace, warn};

use crate::alarms::{labels, AlarmManager};
use crate::config::{DisplayItem, ItemConfig, PatternConfig, SystemConfig};
use crate::evaluator::{evaluate_item, evaluate_pattern, EvalState, ItemSeverity, PatternMatch};
use crate::script::{run_with_timeout, FieldValue, ParsedFields, RuleParser};
use crate::spike::{SpikeFilter, SpikeVerdict};
use crate::storage::{StorageBackend, StorageResult};
use crate::{HistorySample, Metric, Severity, System, SystemStatus, Trend};

use super::messages::{Envelope, RawReading, UpdaterMessage};

const WORKER_QUEUE: usize = 256;

/// Routing actor
pub struct UpdaterActor {
    storage: Arc<dyn StorageBackend>,
    events: broadcast::Sender<Envelope>,
    alarms: AlarmManager,

    receiver: mpsc::Receiver<UpdaterMessage>,

    /// Per-system worker queues, keyed by system id
    workers: HashMap<String, mpsc::Sender<RawReading>>,
}

impl UpdaterActor {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        events: broadcast::Sender<Envelope>,
        alarms: AlarmManager,
        receiver: mpsc::Receiver<UpdaterMessage>,
    ) -> Self {
        Self {
            storage,
            events,
            alarms,
            receiver,
            workers: HashMap::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting updater actor");

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                UpdaterMessage::Ingest(reading) => self.route(reading).await,
                UpdaterMessage::SystemDeleted(id) => {
                    if self.workers.remove(&id).is_some() {
                        debug!("evicted worker for deleted system {id}");
                    }
                }
            }
        }

        debug!("updater actor stopped");
    }

    async fn route(&mut self, reading: RawReading) {
        let systems = match self
            .storage
            .systems_for_port(reading.port, reading.protocol)
            .await
        {
            Ok(systems) => systems,
            Err(e) => {
                warn!("system lookup for port {} failed: {e}", reading.port);
                return;
            }
        };

        if systems.is_empty() {
            trace!("no system registered on port {}, dropping", reading.port);
            return;
        }

        for system in systems {
            let tx = self.worker_for(&system.id);
            if tx.send(reading.clone()).await.is_err() {
                // Worker died; replace it and retry once.
                self.workers.remove(&system.id);
                let tx = self.worker_for(&system.id);
                let _ = tx.send(reading.clone()).await;
            }
        }
    }

    fn worker_for(&mut self, system_id: &str) -> mpsc::Sender<RawReading> {
        self.workers
            .entry(system_id.to_string())
            .or_insert_with(|| {
                debug!("spawning worker for system {system_id}");
                let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                let worker = SystemWorker::new(
                    system_id.to_string(),
                    self.storage.clone(),
                    self.events.clone(),
                    self.alarms.clone(),
                );
                tokio::spawn(worker.run(rx));
                tx
            })
            .clone()
    }
}

/// Handle for the updater actor
#[derive(Clone)]
pub struct UpdaterHandle {
    sender: mpsc::Sender<UpdaterMessage>,
}

impl UpdaterHandle {
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        events: broadcast::Sender<Envelope>,
        alarms: AlarmManager,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);

        let actor = UpdaterActor::new(storage, events, alarms, rx);
        tokio::spawn(actor.run());

        Self { sender: tx }
    }

    pub async fn ingest(&self, reading: RawReading) {
        let _ = self.sender.send(UpdaterMessage::Ingest(reading)).await;
    }

    pub async fn system_deleted(&self, system_id: String) {
        let _ = self
            .sender
            .send(UpdaterMessage::SystemDeleted(system_id))
            .await;
    }
}

/// One value extracted for a display item.
#[derive(Debug)]
struct Extracted {
    value: Option<f64>,
    text: Option<String>,
}

/// Per-system processing task. Owns every piece of mutable pipeline
/// state for its system.
struct SystemWorker {
    system_id: String,
    storage: Arc<dyn StorageBackend>,
    events: broadcast::Sender<Envelope>,
    alarms: AlarmManager,

    eval: EvalState,
    spikes: HashMap<String, SpikeFilter>,
    last_values: HashMap<String, f64>,
    parser: RuleParser,
}

impl SystemWorker {
    fn new(
        system_id: String,
        storage: Arc<dyn StorageBackend>,
        events: broadcast::Sender<Envelope>,
        alarms: AlarmManager,
    ) -> Self {
        Self {
            system_id,
            storage,
            events,
            alarms,
            eval: EvalState::new(),
            spikes: HashMap::new(),
            last_values: HashMap::new(),
            parser: RuleParser,
        }
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<RawReading>) {
        while let Some(reading) = receiver.recv().await {
            if let Err(e) = self.process(reading).await {
                warn!("worker for {} failed to process reading: {e}", self.system_id);
            }
        }
        trace!("worker for {} stopped", self.system_id);
    }

    #[instrument(skip_all, fields(system_id = %self.system_id))]
    async fn process(&mut self, reading: RawReading) -> StorageResult<()> {
        // Config is re-fetched per reading so edits apply immediately.
        let Some(mut system) = self.storage.get_system(&self.system_id).await? else {
            return Ok(());
        };
        if !system.enabled || !system.active {
            return Ok(());
        }

        let text = reading.reading.text.clone();

        // A failing custom parser discards the whole reading before it
        // counts as contact, so a dead script cannot keep a silent
        // system looking alive.
        let fields = if let SystemConfig::Items(config) = &system.config
            && let Some(code) = &config.script
        {
            match run_with_timeout(&self.parser, &self.system_id, code, &text).await {
                Ok(fields) => Some(fields),
                Err(e) => {
                    warn!("custom parser failed, reading discarded: {e}");
                    return Ok(());
                }
            }
        } else {
            None
        };

        self.storage
            .touch_last_data(&self.system_id, reading.reading.received_at)
            .await?;

        // Any reading at all proves the system is back online.
        if system.status == SystemStatus::Offline {
            debug!("system came back online");
            self.alarms
                .resolve_message(&self.system_id, labels::OFFLINE)
                .await?;
            self.sync_status(&system, SystemStatus::Normal).await?;
            system.status = SystemStatus::Normal;
        }

        let new_status = match system.config.clone() {
            SystemConfig::Patterns(config) => {
                self.process_pattern(&text, &config, &system.name).await?
            }
            SystemConfig::Items(config) => {
                self.process_items(&text, &config, fields, &system.name, reading.reading.received_at)
                    .await?
            }
            // Received but not evaluated, the current status stands.
            SystemConfig::Unrecognized(_) => {
                trace!("unrecognized config shape, liveness only");
                return Ok(());
            }
        };

        self.sync_status(&system, new_status).await?;
        Ok(())
    }

    /// Pattern mode: the whole reading is one status string.
    async fn process_pattern(
        &mut self,
        text: &str,
        config: &PatternConfig,
        system_name: &str,
    ) -> StorageResult<SystemStatus> {
        match evaluate_pattern(text, config) {
            PatternMatch::Critical => {
                self.eval.observe_pattern(true);
            }
            PatternMatch::Normal => {
                self.eval.observe_pattern(false);
            }
            // Counters untouched, only liveness updated.
            PatternMatch::Unmatched => {
                trace!("reading {text:?} matched no configured pattern");
            }
        }

        // The latest status line is kept as a text metric.
        let metric = self
            .storage
            .upsert_metric(Metric {
                id: String::new(),
                system_id: self.system_id.clone(),
                name: "status".to_string(),
                unit: None,
                value: None,
                text_value: Some(text.to_string()),
                trend: Trend::Stable,
                min: None,
                max: None,
            })
            .await?;
        let _ = self.events.send(Envelope::metric(&metric, system_name));

        if self.eval.pattern_confirmed() {
            self.alarms
                .raise(
                    &self.system_id,
                    Severity::Critical,
                    labels::STATUS_CRITICAL,
                    Some(text.to_string()),
                )
                .await?;
            Ok(SystemStatus::Critical)
        } else {
            self.alarms
                .resolve_message(&self.system_id, labels::STATUS_CRITICAL)
                .await?;
            Ok(SystemStatus::Normal)
        }
    }

    /// Condition mode: extract each display item, filter spikes, update
    /// metrics and history, evaluate thresholds.
    async fn process_items(
        &mut self,
        text: &str,
        config: &ItemConfig,
        fields: Option<ParsedFields>,
        system_name: &str,
        received_at: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<SystemStatus> {
        // Items removed by a config edit must not keep voting on the
        // aggregate through their stale counters.
        let current: Vec<&str> = config.items.iter().map(|i| i.name.as_str()).collect();
        self.eval.retain_items(&current);

        let tokens: Vec<&str> = text.split_whitespace().collect();

        for item in &config.items {
            let extracted = match &fields {
                Some(fields) => Self::extract_from_fields(item, fields),
                None => Self::extract_from_tokens(item, text, &tokens),
            };
            let Some(extracted) = extracted else {
                trace!("no value for item {:?} in this reading", item.name);
                continue;
            };

            if let Some(v) = extracted.value {
                let range = item.min.zip(item.max);
                let filter = self.spikes.entry(item.name.clone()).or_default();
                if filter.check(v, range) == SpikeVerdict::Rejected {
                    debug!("rejected spike {v} for item {:?}", item.name);
                    continue;
                }

                let trend = self.trend_for(&item.name, v);
                let metric = self
                    .storage
                    .upsert_metric(Metric {
                        id: String::new(),
                        system_id: self.system_id.clone(),
                        name: item.name.clone(),
                        unit: item.unit.clone(),
                        value: Some(v),
                        text_value: extracted.text.clone(),
                        trend,
                        min: item.min,
                        max: item.max,
                    })
                    .await?;

                self.storage
                    .append_history(HistorySample {
                        metric_id: metric.id.clone(),
                        timestamp: received_at,
                        value: v,
                    })
                    .await?;

                let _ = self.events.send(Envelope::metric(&metric, system_name));
            } else if extracted.text.is_some() {
                let metric = self
                    .storage
                    .upsert_metric(Metric {
                        id: String::new(),
                        system_id: self.system_id.clone(),
                        name: item.name.clone(),
                        unit: item.unit.clone(),
                        value: None,
                        text_value: extracted.text.clone(),
                        trend: Trend::Stable,
                        min: item.min,
                        max: item.max,
                    })
                    .await?;
                let _ = self.events.send(Envelope::metric(&metric, system_name));
            } else {
                continue;
            }

            let severity = evaluate_item(item, extracted.value, extracted.text.as_deref());
            self.eval.observe_item(&item.name, severity);

            if item.alarm_enabled {
                self.sync_item_alarms(item, severity, extracted.value).await?;
            }
        }

        Ok(self.eval.aggregate_status())
    }

    async fn sync_item_alarms(
        &mut self,
        item: &DisplayItem,
        severity: ItemSeverity,
        value: Option<f64>,
    ) -> StorageResult<()> {
        let value_str = value.map(|v| v.to_string());

        // Critical alarms follow the debounced confirmation.
        if self.eval.item_confirmed(&item.name) {
            self.alarms
                .raise(
                    &self.system_id,
                    Severity::Critical,
                    &labels::item_critical(&item.name),
                    value_str.clone(),
                )
                .await?;
        } else {
            self.alarms
                .resolve_message(&self.system_id, &labels::item_critical(&item.name))
                .await?;
        }

        // Warning alarms are immediate in both directions.
        if severity == ItemSeverity::Warning {
            self.alarms
                .raise(
                    &self.system_id,
                    Severity::Warning,
                    &labels::item_warning(&item.name),
                    value_str,
                )
                .await?;
        } else {
            self.alarms
                .resolve_message(&self.system_id, &labels::item_warning(&item.name))
                .await?;
        }

        Ok(())
    }

    fn trend_for(&mut self, name: &str, value: f64) -> Trend {
        let trend = match self.last_values.get(name) {
            Some(&previous) if value > previous + f64::EPSILON => Trend::Up,
            Some(&previous) if value < previous - f64::EPSILON => Trend::Down,
            Some(_) => Trend::Stable,
            None => Trend::Stable,
        };
        self.last_values.insert(name.to_string(), value);
        trend
    }

    fn extract_from_fields(item: &DisplayItem, fields: &ParsedFields) -> Option<Extracted> {
        match fields.get(&item.name)? {
            FieldValue::Number(n) => Some(Extracted {
                value: Some(*n),
                text: None,
            }),
            FieldValue::Text(s) => Some(Extracted {
                value: s.parse().ok(),
                text: Some(s.clone()),
            }),
        }
    }

    fn extract_from_tokens(item: &DisplayItem, raw: &str, tokens: &[&str]) -> Option<Extracted> {
        let token = if let Some(matchers) = &item.matchers {
            matchers.iter().find_map(|m| {
                let re = match Regex::new(&m.pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        warn!("invalid matcher pattern {:?}: {e}", m.pattern);
                        return None;
                    }
                };
                re.captures(raw)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })?
        } else {
            tokens.get(item.index?)?.to_string()
        };

        Some(Extracted {
            value: token.parse().ok(),
            text: Some(token),
        })
    }

    async fn sync_status(&self, system: &System, new_status: SystemStatus) -> StorageResult<()> {
        if system.status == new_status {
            return Ok(());
        }

        debug!("status {:?} -> {new_status:?}", system.status);
        self.storage
            .update_system_status(&self.system_id, new_status)
            .await?;

        let mut updated = system.clone();
        updated.status = new_status;
        let _ = self.events.send(Envelope::system(&updated));
        Ok(())
    }
}
