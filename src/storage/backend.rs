//! Storage backend trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Protocol;
use crate::{Alarm, HistorySample, Metric, Settings, Severity, Siren, System, SystemStatus};

use super::error::StorageResult;

/// Durable-state contract the worker depends on.
///
/// All backends must be `Send + Sync`; every method is async for
/// compatibility with Tokio. Implementations convert backend-specific
/// errors to `StorageError` variants. Callers treat failures as local:
/// the triggering event is dropped and processing continues (the next
/// reading re-derives correct state).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Systems
    // ========================================================================

    /// Active, enabled systems bound to a listener port.
    async fn systems_for_port(&self, port: u16, protocol: Protocol)
    -> StorageResult<Vec<System>>;

    /// All active, enabled systems (offline sweep input).
    async fn active_systems(&self) -> StorageResult<Vec<System>>;

    async fn get_system(&self, id: &str) -> StorageResult<Option<System>>;

    /// Insert or replace a system row (startup seeding, tests).
    async fn upsert_system(&self, system: System) -> StorageResult<()>;

    async fn delete_system(&self, id: &str) -> StorageResult<()>;

    async fn update_system_status(&self, id: &str, status: SystemStatus) -> StorageResult<()>;

    /// Record the arrival time of the last accepted reading.
    async fn touch_last_data(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()>;

    // ========================================================================
    // Metrics & history
    // ========================================================================

    async fn get_metric(&self, system_id: &str, name: &str) -> StorageResult<Option<Metric>>;

    /// Insert or update a metric's current value/trend/text. Assigns an
    /// id on first insert; returns the stored row.
    async fn upsert_metric(&self, metric: Metric) -> StorageResult<Metric>;

    /// Append one immutable history sample.
    async fn append_history(&self, sample: HistorySample) -> StorageResult<()>;

    /// Raw sample count inside a window (downsample no-op detection,
    /// tests).
    async fn history_count(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<usize>;

    /// Coalesce samples inside `[start, end)` into fixed-size bucket
    /// averages per metric. A window already at or below the target
    /// resolution is left untouched. Returns the net row-count
    /// reduction.
    async fn compact_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: chrono::Duration,
    ) -> StorageResult<usize>;

    /// Delete samples older than the retention cutoff. Returns the
    /// number of rows deleted.
    async fn delete_history_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Alarms
    // ========================================================================

    /// The unresolved alarm for a (system, message) pair, if any. The
    /// create-if-absent discipline of the alarm lifecycle hangs off this
    /// lookup.
    async fn find_unresolved_alarm(
        &self,
        system_id: &str,
        message: &str,
    ) -> StorageResult<Option<Alarm>>;

    async fn unresolved_alarms(&self, system_id: &str) -> StorageResult<Vec<Alarm>>;

    async fn create_alarm(
        &self,
        system_id: &str,
        severity: Severity,
        message: &str,
        value: Option<String>,
    ) -> StorageResult<Alarm>;

    /// Resolve alarms for a system. `ids = None` resolves every
    /// unresolved alarm; otherwise only the listed ids. Returns the ids
    /// actually resolved (already-resolved alarms are skipped, making a
    /// double resolve a no-op).
    async fn resolve_alarms(
        &self,
        system_id: &str,
        ids: Option<&[String]>,
    ) -> StorageResult<Vec<String>>;

    async fn acknowledge_alarm(&self, id: &str) -> StorageResult<()>;

    /// Unresolved AND unacknowledged critical alarms, system-wide. The
    /// siren synchronizer reconciles against this count.
    async fn count_unacked_critical(&self) -> StorageResult<usize>;

    /// Append an audit row for an alarm state change.
    async fn append_alarm_log(&self, alarm_id: &str, action: &str) -> StorageResult<()>;

    // ========================================================================
    // Sirens & settings
    // ========================================================================

    async fn sirens(&self) -> StorageResult<Vec<Siren>>;

    async fn upsert_siren(&self, siren: Siren) -> StorageResult<()>;

    async fn settings(&self) -> StorageResult<Settings>;

    async fn update_settings(&self, settings: Settings) -> StorageResult<()>;

    /// Close the backend and release resources.
    async fn close(&self) -> StorageResult<()>;
}
