//! In-memory storage backend (no persistence)
//!
//! Fully functional backend holding all state behind a `RwLock`. It's
//! used for:
//! - Testing without database dependencies
//! - Deployments that accept losing state on restart (the next readings
//!   re-derive current status anyway)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Protocol;
use crate::{
    Alarm, HistorySample, Metric, Settings, Severity, Siren, System, SystemStatus, Trend,
};

use super::backend::StorageBackend;
use super::error::StorageResult;

#[derive(Default)]
struct State {
    systems: HashMap<String, System>,
    metrics: HashMap<String, Metric>,
    history: Vec<HistorySample>,
    alarms: HashMap<String, Alarm>,
    alarm_log: Vec<(String, String, DateTime<Utc>)>,
    sirens: HashMap<String, Siren>,
    settings: Settings,
}

/// In-memory storage backend
pub struct MemoryBackend {
    state: RwLock<State>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn make_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn systems_for_port(
        &self,
        port: u16,
        protocol: Protocol,
    ) -> StorageResult<Vec<System>> {
        let state = self.state.read().await;
        Ok(state
            .systems
            .values()
            .filter(|s| s.port == port && s.protocol == protocol && s.enabled && s.active)
            .cloned()
            .collect())
    }

    async fn active_systems(&self) -> StorageResult<Vec<System>> {
        let state = self.state.read().await;
        Ok(state
            .systems
            .values()
            .filter(|s| s.enabled && s.active)
            .cloned()
            .collect())
    }

    async fn get_system(&self, id: &str) -> StorageResult<Option<System>> {
        Ok(self.state.read().await.systems.get(id).cloned())
    }

    async fn upsert_system(&self, system: System) -> StorageResult<()> {
        self.state
            .write()
            .await
            .systems
            .insert(system.id.clone(), system);
        Ok(())
    }

    async fn delete_system(&self, id: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state.systems.remove(id);
        state.metrics.retain(|_, m| m.system_id != id);
        state.alarms.retain(|_, a| a.system_id != id);
        Ok(())
    }

    async fn update_system_status(&self, id: &str, status: SystemStatus) -> StorageResult<()> {
        if let Some(system) = self.state.write().await.systems.get_mut(id) {
            system.status = status;
        }
        Ok(())
    }

    async fn touch_last_data(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        if let Some(system) = self.state.write().await.systems.get_mut(id) {
            system.last_data = Some(at);
        }
        Ok(())
    }

    async fn get_metric(&self, system_id: &str, name: &str) -> StorageResult<Option<Metric>> {
        let state = self.state.read().await;
        Ok(state
            .metrics
            .values()
            .find(|m| m.system_id == system_id && m.name == name)
            .cloned())
    }

    async fn upsert_metric(&self, mut metric: Metric) -> StorageResult<Metric> {
        let mut state = self.state.write().await;
        let existing_id = state
            .metrics
            .values()
            .find(|m| m.system_id == metric.system_id && m.name == metric.name)
            .map(|m| m.id.clone());

        metric.id = existing_id.unwrap_or_else(|| self.make_id("metric"));
        state.metrics.insert(metric.id.clone(), metric.clone());
        Ok(metric)
    }

    async fn append_history(&self, sample: HistorySample) -> StorageResult<()> {
        self.state.write().await.history.push(sample);
        Ok(())
    }

    async fn history_count(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .count())
    }

    async fn compact_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> StorageResult<usize> {
        let bucket_ms = bucket.num_milliseconds().max(1);
        let mut state = self.state.write().await;

        let (window, keep): (Vec<HistorySample>, Vec<HistorySample>) = state
            .history
            .drain(..)
            .partition(|s| s.timestamp >= start && s.timestamp < end);

        // Bucket key: (metric, floor(timestamp / bucket))
        let mut buckets: HashMap<(String, i64), (f64, usize, DateTime<Utc>)> = HashMap::new();
        for sample in &window {
            let slot = sample.timestamp.timestamp_millis().div_euclid(bucket_ms);
            let entry = buckets
                .entry((sample.metric_id.clone(), slot))
                .or_insert((0.0, 0, sample.timestamp));
            entry.0 += sample.value;
            entry.1 += 1;
            if sample.timestamp < entry.2 {
                entry.2 = sample.timestamp;
            }
        }

        if buckets.len() >= window.len() {
            // Window already at or below target resolution.
            state.history = keep;
            state.history.extend(window);
            return Ok(0);
        }

        let removed = window.len() - buckets.len();
        state.history = keep;
        for ((metric_id, _), (sum, count, first_ts)) in buckets {
            state.history.push(HistorySample {
                metric_id,
                timestamp: first_ts,
                value: sum / count as f64,
            });
        }

        debug!("compacted {removed} samples in [{start}, {end})");
        Ok(removed)
    }

    async fn delete_history_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let before = state.history.len();
        state.history.retain(|s| s.timestamp >= cutoff);
        Ok(before - state.history.len())
    }

    async fn find_unresolved_alarm(
        &self,
        system_id: &str,
        message: &str,
    ) -> StorageResult<Option<Alarm>> {
        let state = self.state.read().await;
        Ok(state
            .alarms
            .values()
            .find(|a| a.system_id == system_id && a.message == message && a.is_unresolved())
            .cloned())
    }

    async fn unresolved_alarms(&self, system_id: &str) -> StorageResult<Vec<Alarm>> {
        let state = self.state.read().await;
        Ok(state
            .alarms
            .values()
            .filter(|a| a.system_id == system_id && a.is_unresolved())
            .cloned()
            .collect())
    }

    async fn create_alarm(
        &self,
        system_id: &str,
        severity: Severity,
        message: &str,
        value: Option<String>,
    ) -> StorageResult<Alarm> {
        let alarm = Alarm {
            id: self.make_id("alarm"),
            system_id: system_id.to_string(),
            severity,
            message: message.to_string(),
            value,
            acknowledged: false,
            acknowledged_at: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .alarms
            .insert(alarm.id.clone(), alarm.clone());
        Ok(alarm)
    }

    async fn resolve_alarms(
        &self,
        system_id: &str,
        ids: Option<&[String]>,
    ) -> StorageResult<Vec<String>> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut resolved = Vec::new();

        for alarm in state.alarms.values_mut() {
            if alarm.system_id != system_id || !alarm.is_unresolved() {
                continue;
            }
            if let Some(ids) = ids
                && !ids.contains(&alarm.id)
            {
                continue;
            }
            alarm.resolved_at = Some(now);
            resolved.push(alarm.id.clone());
        }

        Ok(resolved)
    }

    async fn acknowledge_alarm(&self, id: &str) -> StorageResult<()> {
        if let Some(alarm) = self.state.write().await.alarms.get_mut(id) {
            alarm.acknowledged = true;
            alarm.acknowledged_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn count_unacked_critical(&self) -> StorageResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .alarms
            .values()
            .filter(|a| a.is_unresolved() && !a.acknowledged && a.severity == Severity::Critical)
            .count())
    }

    async fn append_alarm_log(&self, alarm_id: &str, action: &str) -> StorageResult<()> {
        self.state
            .write()
            .await
            .alarm_log
            .push((alarm_id.to_string(), action.to_string(), Utc::now()));
        Ok(())
    }

    async fn sirens(&self) -> StorageResult<Vec<Siren>> {
        Ok(self.state.read().await.sirens.values().cloned().collect())
    }

    async fn upsert_siren(&self, siren: Siren) -> StorageResult<()> {
        self.state
            .write()
            .await
            .sirens
            .insert(siren.id.clone(), siren);
        Ok(())
    }

    async fn settings(&self) -> StorageResult<Settings> {
        Ok(self.state.read().await.settings.clone())
    }

    async fn update_settings(&self, settings: Settings) -> StorageResult<()> {
        self.state.write().await.settings = settings;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}

/// Convenience constructor for a metric row that hasn't been stored yet.
pub fn new_metric(system_id: &str, name: &str, unit: Option<String>) -> Metric {
    Metric {
        id: String::new(),
        system_id: system_id.to_string(),
        name: name.to_string(),
        unit,
        value: None,
        text_value: None,
        trend: Trend::Stable,
        min: None,
        max: None,
    }
}
