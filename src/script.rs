//! Custom-parser hook
//!
//! User-supplied, per-system parsing logic is treated as an opaque
//! pluggable function: it receives the raw reading and returns a flat
//! mapping of metric name → value, or fails. Execution is bounded by a
//! hard wall-clock timeout; any failure discards the whole reading (no
//! partial application, no liveness update for that cycle).
//!
//! The shipped engine is a small declarative rule DSL rather than a
//! general interpreter — one rule per line:
//!
//! ```text
//! temperature = index 1        # second whitespace token, parsed as number
//! state       = text 0         # first token, kept as text
//! humidity    = match /H:(\d+)/   # first capture group, parsed as number
//! ```
//!
//! Lines starting with `#` and blank lines are ignored. An empty result
//! map is a valid "no metric in this line" outcome, distinct from a
//! parse failure.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::timeout;
use tracing::warn;

/// Hard wall-clock limit on custom-parser execution.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

pub type ParsedFields = HashMap<String, FieldValue>;

#[derive(Debug)]
pub enum ScriptError {
    BadRule(String),
    BadPattern(String),
    Timeout,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::BadRule(rule) => write!(f, "unparseable rule: {rule}"),
            ScriptError::BadPattern(p) => write!(f, "invalid match pattern: {p}"),
            ScriptError::Timeout => write!(f, "custom parser exceeded its time budget"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Pluggable custom parser. Implementations must be side-effect free;
/// the caller enforces the timeout via [`run_with_timeout`].
#[async_trait]
pub trait CustomParser: Send + Sync {
    async fn parse(
        &self,
        system_id: &str,
        code: &str,
        raw: &str,
    ) -> Result<ParsedFields, ScriptError>;
}

/// Run a custom parser under the hard wall-clock timeout. A timeout is a
/// failure like any other: the whole reading is discarded.
pub async fn run_with_timeout(
    parser: &dyn CustomParser,
    system_id: &str,
    code: &str,
    raw: &str,
) -> Result<ParsedFields, ScriptError> {
    match timeout(SCRIPT_TIMEOUT, parser.parse(system_id, code, raw)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("custom parser for {system_id} timed out");
            Err(ScriptError::Timeout)
        }
    }
}

/// The default rule-DSL engine.
pub struct RuleParser;

#[async_trait]
impl CustomParser for RuleParser {
    async fn parse(
        &self,
        _system_id: &str,
        code: &str,
        raw: &str,
    ) -> Result<ParsedFields, ScriptError> {
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        let mut fields = ParsedFields::new();

        for line in code.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (name, rule) = line
                .split_once('=')
                .ok_or_else(|| ScriptError::BadRule(line.to_string()))?;
            let name = name.trim();
            let rule = rule.trim();

            if let Some(index) = rule.strip_prefix("index ") {
                let index: usize = index
                    .trim()
                    .parse()
                    .map_err(|_| ScriptError::BadRule(line.to_string()))?;
                // Token missing or non-numeric: the rule simply yields
                // nothing for this line.
                if let Some(value) = tokens.get(index).and_then(|t| t.parse::<f64>().ok()) {
                    fields.insert(name.to_string(), FieldValue::Number(value));
                }
            } else if let Some(index) = rule.strip_prefix("text ") {
                let index: usize = index
                    .trim()
                    .parse()
                    .map_err(|_| ScriptError::BadRule(line.to_string()))?;
                if let Some(token) = tokens.get(index) {
                    fields.insert(name.to_string(), FieldValue::Text(token.to_string()));
                }
            } else if let Some(pattern) = rule
                .strip_prefix("match /")
                .and_then(|p| p.strip_suffix('/'))
            {
                let re =
                    Regex::new(pattern).map_err(|_| ScriptError::BadPattern(pattern.into()))?;
                if let Some(capture) = re.captures(raw).and_then(|c| c.get(1)) {
                    let text = capture.as_str();
                    let value = text
                        .parse::<f64>()
                        .map(FieldValue::Number)
                        .unwrap_or_else(|_| FieldValue::Text(text.to_string()));
                    fields.insert(name.to_string(), value);
                }
            } else {
                return Err(ScriptError::BadRule(line.to_string()));
            }
        }

        Ok(fields)
    }
}
