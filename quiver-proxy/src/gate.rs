//! Feature-gate evaluation: pre-bandit conditions that can force a
//! deterministic arm or exclude a request from an experiment.
//!
//! Evaluation is total: every comparison that cannot be made means "rule
//! fails", never an error. The caller wraps config loading with the same
//! fail-open posture, so a broken gate can never break selection.

use std::collections::HashMap;

use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};

use quiver_core::gate::{GateConfig, GateRule, RuleOperator};

/// State flags computed before the rule walk. Any one of them short-circuits
/// the gate to the configured default arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateFlags {
    pub disabled: bool,
    pub blackout: bool,
    pub outside_rollout: bool,
}

impl GateFlags {
    pub fn short_circuits(&self) -> bool {
        self.disabled || self.blackout || self.outside_rollout
    }
}

pub struct FeatureGate;

impl FeatureGate {
    /// `Some(arm_id)` commits that arm; `None` proceeds to bandit selection.
    pub fn evaluate(
        config: &GateConfig,
        context_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Option<String> {
        let flags = Self::render_flags(config, context_id);
        if flags.short_circuits() {
            return config.default_arm_id.clone();
        }
        for rule in &config.rules {
            if rule_matches(rule, metadata) {
                return rule.committed_arm_id.clone();
            }
        }
        None
    }

    pub fn render_flags(config: &GateConfig, context_id: &str) -> GateFlags {
        GateFlags {
            disabled: !config.enabled,
            blackout: !Self::in_active_schedule(config),
            outside_rollout: !Self::in_rollout(context_id, config.rollout_percentage),
        }
    }

    /// Stable rollout bucketing: SHA-256 of the context id, first 8 bytes as
    /// a big-endian u64, modulo 100. The hash is fixed deliberately —
    /// changing it would reshuffle the rollout population across deploys.
    pub fn rollout_bucket(context_id: &str) -> u64 {
        let digest = Sha256::digest(context_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix) % 100
    }

    fn in_rollout(context_id: &str, percentage: f64) -> bool {
        (Self::rollout_bucket(context_id) as f64) < percentage
    }

    fn in_active_schedule(config: &GateConfig) -> bool {
        let now = Utc::now();
        if let Some(start) = config.schedule.start {
            if now < start {
                return false;
            }
        }
        if let Some(end) = config.schedule.end {
            if now > end {
                return false;
            }
        }
        let (Some(start), Some(end)) = (config.active_hours.start, config.active_hours.end)
        else {
            // Active hours constrain only when both endpoints are set.
            return true;
        };
        let tz: Tz = config.timezone.parse().unwrap_or(Tz::UTC);
        let local_time = now.with_timezone(&tz).time();
        in_daily_window(local_time, start, end)
    }
}

/// `start > end` wraps the window over midnight.
fn in_daily_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

/// A missing key or an impossible comparison fails the rule.
fn rule_matches(rule: &GateRule, metadata: &HashMap<String, String>) -> bool {
    let Some(actual) = metadata.get(&rule.key) else {
        return false;
    };
    match rule.operator {
        RuleOperator::Eq => scalar_eq(actual, &rule.value).unwrap_or(false),
        RuleOperator::Ne => scalar_eq(actual, &rule.value).map(|b| !b).unwrap_or(false),
        RuleOperator::Gt => ordering(actual, &rule.value).map(|o| o.is_gt()).unwrap_or(false),
        RuleOperator::Lt => ordering(actual, &rule.value).map(|o| o.is_lt()).unwrap_or(false),
        RuleOperator::Ge => ordering(actual, &rule.value).map(|o| o.is_ge()).unwrap_or(false),
        RuleOperator::Le => ordering(actual, &rule.value).map(|o| o.is_le()).unwrap_or(false),
        RuleOperator::Contains => scalar_text(&rule.value)
            .map(|needle| actual.contains(&needle))
            .unwrap_or(false),
        RuleOperator::NotContains => scalar_text(&rule.value)
            .map(|needle| !actual.contains(&needle))
            .unwrap_or(false),
        RuleOperator::In => rule
            .value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .any(|item| scalar_eq(actual, item).unwrap_or(false))
            })
            .unwrap_or(false),
        RuleOperator::NotIn => rule
            .value
            .as_array()
            .map(|items| {
                !items
                    .iter()
                    .any(|item| scalar_eq(actual, item).unwrap_or(false))
            })
            .unwrap_or(false),
    }
}

/// Scalar equality between a metadata string and a JSON value. `None` means
/// the types are not comparable.
fn scalar_eq(actual: &str, value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::String(s) => Some(actual == s),
        serde_json::Value::Number(n) => {
            let expected = n.as_f64()?;
            let parsed: f64 = actual.parse().ok()?;
            Some(parsed == expected)
        }
        serde_json::Value::Bool(b) => {
            let parsed: bool = actual.parse().ok()?;
            Some(parsed == *b)
        }
        _ => None,
    }
}

/// Ordering between a metadata string and a JSON value: numeric when the
/// value is a number, lexicographic when it is a string.
fn ordering(actual: &str, value: &serde_json::Value) -> Option<std::cmp::Ordering> {
    match value {
        serde_json::Value::Number(n) => {
            let expected = n.as_f64()?;
            let parsed: f64 = actual.parse().ok()?;
            parsed.partial_cmp(&expected)
        }
        serde_json::Value::String(s) => Some(actual.cmp(s.as_str())),
        _ => None,
    }
}

fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
