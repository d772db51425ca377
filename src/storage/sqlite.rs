//! SQLite storage backend implementation
//!
//! Embedded, WAL-mode SQLite behind the `StorageBackend` trait. The
//! schema is created at connect; system config blobs are stored as JSON
//! alongside typed columns for everything that is queried.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use crate::config::Protocol;
use crate::{
    Alarm, HistorySample, Metric, Settings, Severity, Siren, System, SystemStatus, Trend,
};

use super::backend::StorageBackend;
use super::error::{StorageError, StorageResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS systems (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    kind        TEXT NOT NULL,
    port        INTEGER NOT NULL,
    protocol    TEXT NOT NULL,
    enabled     INTEGER NOT NULL,
    active      INTEGER NOT NULL,
    config      TEXT NOT NULL,
    last_data   INTEGER,
    status      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_systems_port ON systems (port, protocol);

CREATE TABLE IF NOT EXISTS metrics (
    id          TEXT PRIMARY KEY,
    system_id   TEXT NOT NULL,
    name        TEXT NOT NULL,
    unit        TEXT,
    value       REAL,
    text_value  TEXT,
    trend       TEXT NOT NULL,
    min         REAL,
    max         REAL,
    UNIQUE (system_id, name)
);

CREATE TABLE IF NOT EXISTS history (
    metric_id   TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    value       REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_ts ON history (timestamp);
CREATE INDEX IF NOT EXISTS idx_history_metric ON history (metric_id, timestamp);

CREATE TABLE IF NOT EXISTS alarms (
    id              TEXT PRIMARY KEY,
    system_id       TEXT NOT NULL,
    severity        TEXT NOT NULL,
    message         TEXT NOT NULL,
    value           TEXT,
    acknowledged    INTEGER NOT NULL DEFAULT 0,
    acknowledged_at INTEGER,
    resolved_at     INTEGER,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alarms_open ON alarms (system_id, resolved_at);

CREATE TABLE IF NOT EXISTS alarm_log (
    alarm_id    TEXT NOT NULL,
    action      TEXT NOT NULL,
    at          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sirens (
    id          TEXT PRIMARY KEY,
    address     TEXT NOT NULL,
    port        INTEGER NOT NULL,
    protocol    TEXT NOT NULL,
    on_command  TEXT NOT NULL,
    off_command TEXT,
    enabled     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL
);
"#;

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Create the database file if missing, apply the schema, and
    /// configure WAL mode.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        debug!("schema applied");
        Ok(Self { pool })
    }

    fn millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn system_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<System> {
        let config: String = row.get("config");
        Ok(System {
            id: row.get("id"),
            name: row.get("name"),
            kind: serde_json::from_value(serde_json::Value::String(row.get("kind")))?,
            port: row.get::<i64, _>("port") as u16,
            protocol: serde_json::from_value(serde_json::Value::String(row.get("protocol")))?,
            enabled: row.get::<i64, _>("enabled") != 0,
            active: row.get::<i64, _>("active") != 0,
            config: serde_json::from_str(&config)?,
            last_data: row
                .get::<Option<i64>, _>("last_data")
                .map(Self::from_millis),
            status: serde_json::from_value(serde_json::Value::String(row.get("status")))?,
        })
    }

    fn metric_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Metric> {
        Ok(Metric {
            id: row.get("id"),
            system_id: row.get("system_id"),
            name: row.get("name"),
            unit: row.get("unit"),
            value: row.get("value"),
            text_value: row.get("text_value"),
            trend: serde_json::from_value(serde_json::Value::String(row.get("trend")))?,
            min: row.get("min"),
            max: row.get("max"),
        })
    }

    fn alarm_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Alarm> {
        Ok(Alarm {
            id: row.get("id"),
            system_id: row.get("system_id"),
            severity: serde_json::from_value(serde_json::Value::String(row.get("severity")))?,
            message: row.get("message"),
            value: row.get("value"),
            acknowledged: row.get::<i64, _>("acknowledged") != 0,
            acknowledged_at: row
                .get::<Option<i64>, _>("acknowledged_at")
                .map(Self::from_millis),
            resolved_at: row
                .get::<Option<i64>, _>("resolved_at")
                .map(Self::from_millis),
            created_at: Self::from_millis(row.get("created_at")),
        })
    }

    fn enum_str<T: serde::Serialize>(value: &T) -> StorageResult<String> {
        match serde_json::to_value(value)? {
            serde_json::Value::String(s) => Ok(s),
            other => Err(StorageError::SerializationError(format!(
                "expected string-serialized enum, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn systems_for_port(
        &self,
        port: u16,
        protocol: Protocol,
    ) -> StorageResult<Vec<System>> {
        let rows = sqlx::query(
            "SELECT * FROM systems WHERE port = ? AND protocol = ? AND enabled = 1 AND active = 1",
        )
        .bind(port as i64)
        .bind(Self::enum_str(&protocol)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::system_from_row).collect()
    }

    async fn active_systems(&self) -> StorageResult<Vec<System>> {
        let rows = sqlx::query("SELECT * FROM systems WHERE enabled = 1 AND active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::system_from_row).collect()
    }

    async fn get_system(&self, id: &str) -> StorageResult<Option<System>> {
        let row = sqlx::query("SELECT * FROM systems WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::system_from_row).transpose()
    }

    async fn upsert_system(&self, system: System) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO systems (id, name, kind, port, protocol, enabled, active, config, last_data, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, kind = excluded.kind, port = excluded.port,
                protocol = excluded.protocol, enabled = excluded.enabled,
                active = excluded.active, config = excluded.config,
                last_data = excluded.last_data, status = excluded.status
            "#,
        )
        .bind(&system.id)
        .bind(&system.name)
        .bind(Self::enum_str(&system.kind)?)
        .bind(system.port as i64)
        .bind(Self::enum_str(&system.protocol)?)
        .bind(system.enabled as i64)
        .bind(system.active as i64)
        .bind(serde_json::to_string(&system.config)?)
        .bind(system.last_data.as_ref().map(Self::millis))
        .bind(Self::enum_str(&system.status)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_system(&self, id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM systems WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM metrics WHERE system_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM alarms WHERE system_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_system_status(&self, id: &str, status: SystemStatus) -> StorageResult<()> {
        sqlx::query("UPDATE systems SET status = ? WHERE id = ?")
            .bind(Self::enum_str(&status)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_last_data(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE systems SET last_data = ? WHERE id = ?")
            .bind(Self::millis(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_metric(&self, system_id: &str, name: &str) -> StorageResult<Option<Metric>> {
        let row = sqlx::query("SELECT * FROM metrics WHERE system_id = ? AND name = ?")
            .bind(system_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::metric_from_row).transpose()
    }

    async fn upsert_metric(&self, mut metric: Metric) -> StorageResult<Metric> {
        if let Some(existing) = self.get_metric(&metric.system_id, &metric.name).await? {
            metric.id = existing.id;
        } else if metric.id.is_empty() {
            metric.id = format!("metric-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0));
        }

        sqlx::query(
            r#"
            INSERT INTO metrics (id, system_id, name, unit, value, text_value, trend, min, max)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (system_id, name) DO UPDATE SET
                unit = excluded.unit, value = excluded.value,
                text_value = excluded.text_value, trend = excluded.trend,
                min = excluded.min, max = excluded.max
            "#,
        )
        .bind(&metric.id)
        .bind(&metric.system_id)
        .bind(&metric.name)
        .bind(&metric.unit)
        .bind(metric.value)
        .bind(&metric.text_value)
        .bind(Self::enum_str(&metric.trend)?)
        .bind(metric.min)
        .bind(metric.max)
        .execute(&self.pool)
        .await?;

        Ok(metric)
    }

    async fn append_history(&self, sample: HistorySample) -> StorageResult<()> {
        sqlx::query("INSERT INTO history (metric_id, timestamp, value) VALUES (?, ?, ?)")
            .bind(&sample.metric_id)
            .bind(Self::millis(&sample.timestamp))
            .bind(sample.value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn history_count(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM history WHERE timestamp >= ? AND timestamp < ?")
                .bind(Self::millis(&start))
                .bind(Self::millis(&end))
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn compact_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: Duration,
    ) -> StorageResult<usize> {
        let bucket_ms = bucket.num_milliseconds().max(1);
        let start_ms = Self::millis(&start);
        let end_ms = Self::millis(&end);

        let mut tx = self.pool.begin().await?;

        let raw: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM history WHERE timestamp >= ? AND timestamp < ?")
                .bind(start_ms)
                .bind(end_ms)
                .fetch_one(&mut *tx)
                .await?
                .get("n");

        let buckets = sqlx::query(
            r#"
            SELECT metric_id,
                   (timestamp / ?) AS slot,
                   MIN(timestamp)  AS first_ts,
                   AVG(value)      AS avg_value
            FROM history
            WHERE timestamp >= ? AND timestamp < ?
            GROUP BY metric_id, slot
            "#,
        )
        .bind(bucket_ms)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&mut *tx)
        .await?;

        if buckets.len() as i64 >= raw {
            // Already at or below target resolution.
            tx.rollback().await?;
            return Ok(0);
        }

        sqlx::query("DELETE FROM history WHERE timestamp >= ? AND timestamp < ?")
            .bind(start_ms)
            .bind(end_ms)
            .execute(&mut *tx)
            .await?;

        let kept = buckets.len();
        for row in buckets {
            sqlx::query("INSERT INTO history (metric_id, timestamp, value) VALUES (?, ?, ?)")
                .bind(row.get::<String, _>("metric_id"))
                .bind(row.get::<i64, _>("first_ts"))
                .bind(row.get::<f64, _>("avg_value"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let removed = raw as usize - kept;
        debug!("compacted {removed} samples in [{start}, {end})");
        Ok(removed)
    }

    async fn delete_history_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM history WHERE timestamp < ?")
            .bind(Self::millis(&cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn find_unresolved_alarm(
        &self,
        system_id: &str,
        message: &str,
    ) -> StorageResult<Option<Alarm>> {
        let row = sqlx::query(
            "SELECT * FROM alarms WHERE system_id = ? AND message = ? AND resolved_at IS NULL",
        )
        .bind(system_id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::alarm_from_row).transpose()
    }

    async fn unresolved_alarms(&self, system_id: &str) -> StorageResult<Vec<Alarm>> {
        let rows = sqlx::query("SELECT * FROM alarms WHERE system_id = ? AND resolved_at IS NULL")
            .bind(system_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::alarm_from_row).collect()
    }

    async fn create_alarm(
        &self,
        system_id: &str,
        severity: Severity,
        message: &str,
        value: Option<String>,
    ) -> StorageResult<Alarm> {
        let alarm = Alarm {
            id: format!("alarm-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
            system_id: system_id.to_string(),
            severity,
            message: message.to_string(),
            value,
            acknowledged: false,
            acknowledged_at: None,
            resolved_at: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO alarms (id, system_id, severity, message, value, acknowledged, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&alarm.id)
        .bind(&alarm.system_id)
        .bind(Self::enum_str(&alarm.severity)?)
        .bind(&alarm.message)
        .bind(&alarm.value)
        .bind(Self::millis(&alarm.created_at))
        .execute(&self.pool)
        .await?;

        Ok(alarm)
    }

    async fn resolve_alarms(
        &self,
        system_id: &str,
        ids: Option<&[String]>,
    ) -> StorageResult<Vec<String>> {
        let open = self.unresolved_alarms(system_id).await?;
        let now = Self::millis(&Utc::now());
        let mut resolved = Vec::new();

        for alarm in open {
            if let Some(ids) = ids
                && !ids.contains(&alarm.id)
            {
                continue;
            }
            sqlx::query("UPDATE alarms SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL")
                .bind(now)
                .bind(&alarm.id)
                .execute(&self.pool)
                .await?;
            resolved.push(alarm.id);
        }

        Ok(resolved)
    }

    async fn acknowledge_alarm(&self, id: &str) -> StorageResult<()> {
        sqlx::query("UPDATE alarms SET acknowledged = 1, acknowledged_at = ? WHERE id = ?")
            .bind(Self::millis(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_unacked_critical(&self) -> StorageResult<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM alarms WHERE resolved_at IS NULL AND acknowledged = 0 AND severity = 'critical'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn append_alarm_log(&self, alarm_id: &str, action: &str) -> StorageResult<()> {
        sqlx::query("INSERT INTO alarm_log (alarm_id, action, at) VALUES (?, ?, ?)")
            .bind(alarm_id)
            .bind(action)
            .bind(Self::millis(&Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sirens(&self) -> StorageResult<Vec<Siren>> {
        let rows = sqlx::query("SELECT * FROM sirens")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(Siren {
                    id: row.get("id"),
                    address: row.get("address"),
                    port: row.get::<i64, _>("port") as u16,
                    protocol: serde_json::from_value(serde_json::Value::String(
                        row.get("protocol"),
                    ))?,
                    on_command: row.get("on_command"),
                    off_command: row.get("off_command"),
                    enabled: row.get::<i64, _>("enabled") != 0,
                })
            })
            .collect()
    }

    async fn upsert_siren(&self, siren: Siren) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sirens (id, address, port, protocol, on_command, off_command, enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                address = excluded.address, port = excluded.port,
                protocol = excluded.protocol, on_command = excluded.on_command,
                off_command = excluded.off_command, enabled = excluded.enabled
            "#,
        )
        .bind(&siren.id)
        .bind(&siren.address)
        .bind(siren.port as i64)
        .bind(Self::enum_str(&siren.protocol)?)
        .bind(&siren.on_command)
        .bind(&siren.off_command)
        .bind(siren.enabled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn settings(&self) -> StorageResult<Settings> {
        let audio = sqlx::query("SELECT value FROM settings WHERE key = 'audioEnabled'")
            .fetch_optional(&self.pool)
            .await?;
        let mute = sqlx::query("SELECT value FROM settings WHERE key = 'muteEndTime'")
            .fetch_optional(&self.pool)
            .await?;

        Ok(Settings {
            audio_enabled: audio
                .map(|row| row.get::<String, _>("value") == "true")
                .unwrap_or(true),
            mute_end_time: mute.and_then(|row| {
                row.get::<String, _>("value")
                    .parse::<i64>()
                    .ok()
                    .map(Self::from_millis)
            }),
        })
    }

    async fn update_settings(&self, settings: Settings) -> StorageResult<()> {
        let upsert = "INSERT INTO settings (key, value) VALUES (?, ?)
                      ON CONFLICT (key) DO UPDATE SET value = excluded.value";

        sqlx::query(upsert)
            .bind("audioEnabled")
            .bind(if settings.audio_enabled { "true" } else { "false" })
            .execute(&self.pool)
            .await?;

        match settings.mute_end_time {
            Some(end) => {
                sqlx::query(upsert)
                    .bind("muteEndTime")
                    .bind(Self::millis(&end).to_string())
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM settings WHERE key = 'muteEndTime'")
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing SQLite pool");
        self.pool.close().await;
        Ok(())
    }
}
