use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{Siren, SystemKind};

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./facility.db")
}

/// Transport a listener or siren speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// How bytes on a port are framed into readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Legacy fixed-length binary dialect (20-byte frames, ASCII payload)
    Binary,
    /// Newline-delimited (TCP) or whole-datagram (UDP) UTF-8 text
    Utf8,
}

/// Static port table entry: which label/kind/encoding a listener port
/// carries. Provided as external configuration, never derived at runtime.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PortConfig {
    pub port: u16,
    pub protocol: Protocol,
    pub label: String,
    pub kind: SystemKind,
    #[serde(default = "default_encoding")]
    pub encoding: Encoding,
}

fn default_encoding() -> Encoding {
    Encoding::Binary
}

/// The opaque per-system config blob. Two recognized shapes; anything
/// else deserializes into `Unrecognized` and is received but never
/// evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemConfig {
    Patterns(PatternConfig),
    Items(ItemConfig),
    Unrecognized(serde_json::Value),
}

impl SystemConfig {
    pub fn empty() -> Self {
        SystemConfig::Unrecognized(serde_json::Value::Null)
    }
}

/// Pattern-rule config shape (equipment status lines).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    pub critical_patterns: Vec<String>,
    pub normal_patterns: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Contains,
}

/// Metric-display-item config shape (sensor / UPS readings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    pub items: Vec<DisplayItem>,
    /// Optional user-supplied parsing script, run through the custom
    /// parser hook instead of positional token extraction.
    #[serde(default)]
    pub script: Option<String>,
}

/// Configuration unit describing how to extract and threshold one named
/// metric from a raw reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayItem {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    /// Whitespace-token index into the raw reading
    #[serde(default)]
    pub index: Option<usize>,
    /// Free-form data-match predicates (regex with one capture group)
    #[serde(default)]
    pub matchers: Option<Vec<DataMatch>>,
    /// Legacy scalar thresholds, used when `conditions` is absent
    #[serde(default)]
    pub warning: Option<f64>,
    #[serde(default)]
    pub critical: Option<f64>,
    #[serde(default)]
    pub conditions: Option<StatusConditions>,
    #[serde(default = "default_true")]
    pub alarm_enabled: bool,
    #[serde(default)]
    pub chart_group: Option<String>,
    /// Static range, used by the spike filter's flat-buffer fallback
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMatch {
    pub pattern: String,
}

/// Per-state condition sets. Critical conditions are checked first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusConditions {
    #[serde(default)]
    pub warning: Vec<Condition>,
    #[serde(default)]
    pub critical: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Option<f64>,
    /// String comparison value for eq/neq against textual readings
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Gte,
    Lte,
    Eq,
    Neq,
}

/// Top-level worker configuration file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Static port table (port → label/kind/encoding)
    pub ports: Vec<PortConfig>,

    /// Siren hardware seeded into storage at startup
    #[serde(default)]
    pub sirens: Vec<Siren>,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,

    /// Address listeners bind to
    #[serde(default = "default_bind_addr")]
    pub bind: IpAddr,

    /// WebSocket push-channel port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(crate::util::get_addr())
}

fn default_ws_port() -> u16 {
    crate::util::get_ws_port()
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn pattern_shape_is_recognized() {
        let blob = serde_json::json!({
            "critical_patterns": ["FAULT", "FIRE"],
            "normal_patterns": ["OK"],
            "match_mode": "contains"
        });
        let config: SystemConfig = serde_json::from_value(blob).unwrap();
        assert_matches!(config, SystemConfig::Patterns(p) if p.match_mode == MatchMode::Contains);
    }

    #[test]
    fn item_shape_is_recognized() {
        let blob = serde_json::json!({
            "items": [{
                "name": "temperature",
                "unit": "°C",
                "index": 0,
                "warning": 30.0,
                "critical": 40.0
            }]
        });
        let config: SystemConfig = serde_json::from_value(blob).unwrap();
        assert_matches!(config, SystemConfig::Items(c) if c.items.len() == 1);
    }

    #[test]
    fn malformed_blob_falls_back_to_unrecognized() {
        let blob = serde_json::json!({ "something": "else" });
        let config: SystemConfig = serde_json::from_value(blob).unwrap();
        assert_matches!(config, SystemConfig::Unrecognized(_));
    }

    #[test]
    fn structured_conditions_deserialize() {
        let blob = serde_json::json!({
            "items": [{
                "name": "state",
                "conditions": {
                    "critical": [{ "op": "neq", "text": "online" }],
                    "warning": [{ "op": "gte", "value": 80.0 }]
                }
            }]
        });
        let config: SystemConfig = serde_json::from_value(blob).unwrap();
        let SystemConfig::Items(items) = config else {
            panic!("expected item shape");
        };
        let conditions = items.items[0].conditions.as_ref().unwrap();
        assert_eq!(conditions.critical[0].op, ConditionOp::Neq);
        assert_eq!(conditions.critical[0].text.as_deref(), Some("online"));
    }
}
