pub mod actors;
pub mod alarms;
pub mod api;
pub mod config;
pub mod evaluator;
pub mod listeners;
pub mod parser;
pub mod script;
pub mod spike;
pub mod storage;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Protocol, SystemConfig};

/// Aggregate health of a monitored system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Normal,
    Warning,
    Critical,
    Offline,
}

/// What kind of facility a system monitors. Drives the severity of
/// offline alarms and which config shape is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    Equipment,
    Ups,
    Sensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// One monitored facility (UPS unit, sensor cluster, equipment line).
///
/// Mutated only by the updater workers and the offline detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub id: String,
    pub name: String,
    pub kind: SystemKind,
    pub port: u16,
    pub protocol: Protocol,
    pub enabled: bool,
    pub active: bool,
    pub config: SystemConfig,
    pub last_data: Option<DateTime<Utc>>,
    pub status: SystemStatus,
}

/// Current value of one named metric belonging to a system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub system_id: String,
    pub name: String,
    pub unit: Option<String>,
    pub value: Option<f64>,
    pub text_value: Option<String>,
    pub trend: Trend,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Immutable time-series sample. Created on every accepted numeric
/// reading, compacted or deleted by the downsampler, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySample {
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// An alarm record. At most one *unresolved* alarm may exist per
/// (system, message) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub system_id: String,
    pub severity: Severity,
    pub message: String,
    pub value: Option<String>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alarm {
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Physical siren hardware descriptor. The worker only sends commands
/// to sirens; their configuration is owned elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Siren {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    pub on_command: String,
    pub off_command: Option<String>,
    pub enabled: bool,
}

/// Process-wide settings read by the siren synchronizer. Writes come
/// from an external actor (API / peer viewers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub audio_enabled: bool,
    pub mute_end_time: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            mute_end_time: None,
        }
    }
}

impl Settings {
    /// Whether audio output is currently muted, either explicitly or by
    /// a timed mute that has not yet expired.
    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        if !self.audio_enabled {
            return true;
        }
        matches!(self.mute_end_time, Some(end) if now < end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_ordering_matches_badness() {
        assert!(SystemStatus::Normal < SystemStatus::Warning);
        assert!(SystemStatus::Warning < SystemStatus::Critical);
        assert!(SystemStatus::Critical < SystemStatus::Offline);
    }

    #[test]
    fn timed_mute_expires() {
        let now = Utc::now();
        let settings = Settings {
            audio_enabled: true,
            mute_end_time: Some(now + Duration::minutes(5)),
        };
        assert!(settings.is_muted(now));
        assert!(!settings.is_muted(now + Duration::minutes(6)));
    }

    #[test]
    fn disabled_audio_is_always_muted() {
        let settings = Settings {
            audio_enabled: false,
            mute_end_time: None,
        };
        assert!(settings.is_muted(Utc::now()));
    }
}
