//! Status evaluation state machine
//!
//! Two mutually exclusive evaluation modes selected by the system's
//! config shape:
//!
//! - **Pattern mode** (equipment): the raw string is matched against
//!   configured pattern lists, critical before normal.
//! - **Condition mode** (sensor/UPS): each display item's numeric or
//!   textual value is evaluated against its condition set, falling back
//!   to legacy scalar thresholds.
//!
//! ## Hysteresis State Machine
//!
//! Confirmed-critical transitions are debounced in both directions:
//!
//! ```text
//! candidate critical:   counter += 1 (capped at 3); confirm on reaching 3
//! candidate non-crit:   counter -= 1; release confirmation at 0
//! unmatched reading:    counter untouched
//! ```
//!
//! Three consistent consecutive observations are required for both
//! confirmation and recovery, suppressing single-sample flicker.

use std::collections::HashMap;

use crate::SystemStatus;
use crate::config::{Condition, ConditionOp, DisplayItem, MatchMode, PatternConfig};

/// Consecutive observations required to confirm or release critical.
pub const HYSTERESIS_LIMIT: u8 = 3;

/// What one evaluation cycle decided for an item (before hysteresis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemSeverity {
    Normal,
    Warning,
    Critical,
}

/// Debounce counter for one item (or one pattern-mode system).
#[derive(Debug, Clone, Copy, Default)]
pub struct Hysteresis {
    counter: u8,
    confirmed: bool,
}

impl Hysteresis {
    /// Feed one observation; returns true when the confirmed state
    /// changed this cycle.
    pub fn observe(&mut self, critical: bool) -> bool {
        if critical {
            self.counter = (self.counter + 1).min(HYSTERESIS_LIMIT);
            if self.counter == HYSTERESIS_LIMIT && !self.confirmed {
                self.confirmed = true;
                return true;
            }
        } else {
            self.counter = self.counter.saturating_sub(1);
            if self.counter == 0 && self.confirmed {
                self.confirmed = false;
                return true;
            }
        }
        false
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }
}

/// Outcome of matching a raw reading in pattern mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMatch {
    Critical,
    Normal,
    /// No configured pattern matched; status untouched, liveness still
    /// updates.
    Unmatched,
}

/// Match a raw reading against pattern lists, critical checked first.
pub fn evaluate_pattern(raw: &str, config: &PatternConfig) -> PatternMatch {
    let matches = |patterns: &[String]| {
        patterns.iter().any(|p| match config.match_mode {
            MatchMode::Exact => raw == p,
            MatchMode::Contains => raw.contains(p.as_str()),
        })
    };

    if matches(&config.critical_patterns) {
        PatternMatch::Critical
    } else if matches(&config.normal_patterns) {
        PatternMatch::Normal
    } else {
        PatternMatch::Unmatched
    }
}

/// Evaluate one display item against a numeric and/or textual value.
///
/// Structured conditions win over the legacy scalar thresholds; critical
/// conditions are checked before warning ones.
pub fn evaluate_item(
    item: &DisplayItem,
    value: Option<f64>,
    text: Option<&str>,
) -> ItemSeverity {
    if let Some(conditions) = &item.conditions {
        if conditions.critical.iter().any(|c| condition_met(c, value, text)) {
            return ItemSeverity::Critical;
        }
        if conditions.warning.iter().any(|c| condition_met(c, value, text)) {
            return ItemSeverity::Warning;
        }
        return ItemSeverity::Normal;
    }

    // Legacy scalar thresholds
    let Some(value) = value else {
        return ItemSeverity::Normal;
    };
    if matches!(item.critical, Some(limit) if value >= limit) {
        ItemSeverity::Critical
    } else if matches!(item.warning, Some(limit) if value >= limit) {
        ItemSeverity::Warning
    } else {
        ItemSeverity::Normal
    }
}

fn condition_met(condition: &Condition, value: Option<f64>, text: Option<&str>) -> bool {
    // Textual comparison takes priority when a comparison string is set
    if let Some(expected) = &condition.text {
        let Some(actual) = text else {
            return false;
        };
        return match condition.op {
            ConditionOp::Eq => actual == expected,
            ConditionOp::Neq => actual != expected,
            // Ordering operators are meaningless on text
            ConditionOp::Gte | ConditionOp::Lte => false,
        };
    }

    let (Some(threshold), Some(actual)) = (condition.value, value) else {
        return false;
    };
    match condition.op {
        ConditionOp::Gte => actual >= threshold,
        ConditionOp::Lte => actual <= threshold,
        ConditionOp::Eq => (actual - threshold).abs() < f64::EPSILON,
        ConditionOp::Neq => (actual - threshold).abs() >= f64::EPSILON,
    }
}

/// Per-system evaluation state: hysteresis counters keyed by item name
/// (condition mode) or a single system-level counter (pattern mode),
/// plus the last un-debounced warning verdicts.
///
/// Owned by the system's updater worker, so all access is already
/// serialized per system. Dropped with the worker on system deletion.
#[derive(Debug, Default)]
pub struct EvalState {
    pattern: Hysteresis,
    items: HashMap<String, Hysteresis>,
    warnings: HashMap<String, bool>,
}

impl EvalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a pattern-mode observation; returns true on a confirmed
    /// transition.
    pub fn observe_pattern(&mut self, critical: bool) -> bool {
        self.pattern.observe(critical)
    }

    pub fn pattern_confirmed(&self) -> bool {
        self.pattern.confirmed()
    }

    /// Feed a condition-mode observation for one item; returns true on a
    /// confirmed critical transition for that item.
    pub fn observe_item(&mut self, name: &str, severity: ItemSeverity) -> bool {
        self.warnings
            .insert(name.to_string(), severity == ItemSeverity::Warning);
        self.items
            .entry(name.to_string())
            .or_default()
            .observe(severity == ItemSeverity::Critical)
    }

    pub fn item_confirmed(&self, name: &str) -> bool {
        self.items.get(name).is_some_and(Hysteresis::confirmed)
    }

    /// Drop counters and warning verdicts for items that are no longer
    /// configured.
    pub fn retain_items(&mut self, names: &[&str]) {
        self.items.retain(|name, _| names.contains(&name.as_str()));
        self.warnings.retain(|name, _| names.contains(&name.as_str()));
    }

    /// Names of all items whose critical state is currently confirmed.
    pub fn confirmed_items(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, h)| h.confirmed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Worst confirmed status across all items. Warnings are not
    /// debounced; only the critical confirmation goes through
    /// hysteresis.
    pub fn aggregate_status(&self) -> SystemStatus {
        if self.items.values().any(|h| h.confirmed()) {
            SystemStatus::Critical
        } else if self.warnings.values().any(|&w| w) {
            SystemStatus::Warning
        } else {
            SystemStatus::Normal
        }
    }
}
