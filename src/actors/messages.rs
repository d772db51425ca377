//! Message types exchanged between actors and pushed to viewers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::Protocol;
use crate::parser::Reading;
use crate::{Alarm, Metric, Settings, System};

/// Kind tag of a push-channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Metric,
    System,
    Alarm,
    AlarmResolved,
    Delete,
    Settings,
    Raw,
    Ping,
    SirenSync,
}

/// Wire envelope for every event sent to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    fn new(kind: EventType, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn metric(metric: &Metric, system_name: &str) -> Self {
        Self::new(
            EventType::Metric,
            json!({
                "systemId": metric.system_id,
                "systemName": system_name,
                "metricId": metric.id,
                "metricName": metric.name,
                "value": metric.value,
                "textValue": metric.text_value,
                "unit": metric.unit,
                "trend": metric.trend,
            }),
        )
    }

    pub fn system(system: &System) -> Self {
        Self::new(
            EventType::System,
            json!({
                "systemId": system.id,
                "systemName": system.name,
                "status": system.status,
            }),
        )
    }

    pub fn alarm(alarm: &Alarm, system_name: &str) -> Self {
        Self::new(
            EventType::Alarm,
            json!({
                "systemId": alarm.system_id,
                "systemName": system_name,
                "alarmId": alarm.id,
                "severity": alarm.severity,
                "message": alarm.message,
                "alarmValue": alarm.value,
                "acknowledged": alarm.acknowledged,
            }),
        )
    }

    pub fn alarm_resolved(system_id: &str, system_name: &str, alarm_ids: &[String]) -> Self {
        Self::new(
            EventType::AlarmResolved,
            json!({
                "systemId": system_id,
                "systemName": system_name,
                "alarmIds": alarm_ids,
            }),
        )
    }

    pub fn settings(settings: &Settings) -> Self {
        Self::new(EventType::Settings, json!(settings))
    }

    pub fn raw(port: u16, text: &str) -> Self {
        Self::new(EventType::Raw, json!({ "port": port, "rawData": text }))
    }

    pub fn ping() -> Self {
        Self::new(EventType::Ping, json!({}))
    }

    pub fn siren_sync(active: bool) -> Self {
        Self::new(EventType::SirenSync, json!({ "active": active }))
    }
}

/// One chunk of telemetry as it leaves a listener.
#[derive(Debug, Clone)]
pub struct RawReading {
    pub port: u16,
    pub protocol: Protocol,
    pub reading: Reading,
}

/// Messages handled by the updater actor.
#[derive(Debug)]
pub enum UpdaterMessage {
    Ingest(RawReading),
    SystemDeleted(String),
}

/// Messages handled by the push hub actor.
#[derive(Debug)]
pub enum HubMessage {
    Register {
        id: u64,
        tx: mpsc::Sender<Envelope>,
    },
    Unregister {
        id: u64,
    },
    /// An event a viewer sent upstream. Relayed to the viewer's peers
    /// and applied to storage where it has a domain effect.
    FromViewer {
        viewer: u64,
        envelope: Envelope,
    },
}

/// Messages handled by the siren actor.
#[derive(Debug)]
pub enum SirenMessage {
    /// Re-derive the desired siren state from storage and push it out.
    Reconcile,
    /// Best-effort off command to every siren, used at shutdown.
    Silence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_use_kebab_case_tags() {
        let envelope = Envelope::alarm_resolved("sys-1", "Main UPS", &["a-1".to_string()]);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "alarm-resolved");
        assert_eq!(value["data"]["systemId"], "sys-1");
        assert_eq!(value["data"]["systemName"], "Main UPS");

        let sync: EventType = serde_json::from_value(json!("siren-sync")).unwrap();
        assert_eq!(sync, EventType::SirenSync);
    }

    #[test]
    fn metric_envelope_uses_wire_field_names() {
        let metric = Metric {
            id: "m-1".into(),
            system_id: "sys-1".into(),
            name: "voltage".into(),
            unit: Some("V".into()),
            value: Some(219.7),
            text_value: None,
            trend: crate::Trend::Stable,
            min: None,
            max: None,
        };
        let envelope = Envelope::metric(&metric, "Main UPS");
        assert_eq!(envelope.kind, EventType::Metric);
        assert_eq!(envelope.data["metricId"], "m-1");
        assert_eq!(envelope.data["metricName"], "voltage");
        assert_eq!(envelope.data["systemName"], "Main UPS");
        assert_eq!(envelope.data["value"], 219.7);
        assert_eq!(envelope.data["trend"], "stable");
    }

    #[test]
    fn alarm_and_raw_envelopes_use_wire_field_names() {
        let alarm = Alarm {
            id: "a-1".into(),
            system_id: "sys-1".into(),
            severity: crate::Severity::Critical,
            message: "temperature critical".into(),
            value: Some("150".into()),
            acknowledged: false,
            acknowledged_at: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        let envelope = Envelope::alarm(&alarm, "Cold Room");
        assert_eq!(envelope.data["alarmId"], "a-1");
        assert_eq!(envelope.data["alarmValue"], "150");
        assert_eq!(envelope.data["systemName"], "Cold Room");
        assert_eq!(envelope.data["severity"], "critical");

        let raw = Envelope::raw(7001, "BATT NORMAL");
        assert_eq!(raw.data["port"], 7001);
        assert_eq!(raw.data["rawData"], "BATT NORMAL");
    }
}
