//! Feature-gate configuration model.
//!
//! The gate is evaluated in the proxy tier before bandit selection; this
//! module only carries the durable configuration shape shared by the catalog
//! and the key-value snapshot. Unknown operators are rejected at write time
//! (serde refuses them), not at evaluation time.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Comparison operator for a gate rule. Aliases from the wire
/// (`"=="`, `"equals"`, `"gte"`, ...) normalize to the canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    #[serde(alias = "==", alias = "equals")]
    Eq,
    #[serde(alias = "!=", alias = "not_equals")]
    Ne,
    #[serde(alias = ">", alias = "greater_than")]
    Gt,
    #[serde(alias = "<", alias = "less_than")]
    Lt,
    #[serde(alias = ">=", alias = "gte", alias = "greater_or_equal")]
    Ge,
    #[serde(alias = "<=", alias = "lte", alias = "less_or_equal")]
    Le,
    Contains,
    NotContains,
    In,
    NotIn,
}

/// One metadata filter. First matching rule wins; a missing key or a type
/// mismatch makes the rule fail, never raise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRule {
    pub key: String,
    pub operator: RuleOperator,
    pub value: Value,
    #[serde(default)]
    pub committed_arm_id: Option<String>,
}

/// Calendar window; unset endpoints are unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// Daily window in the gate's timezone. A start later than the end wraps
/// over midnight. Both endpoints must be set for the window to constrain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveHours {
    #[serde(default)]
    pub start: Option<NaiveTime>,
    #[serde(default)]
    pub end: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rollout")]
    pub rollout_percentage: f64,
    #[serde(default)]
    pub default_arm_id: Option<String>,
    #[serde(default)]
    pub schedule: ScheduleWindow,
    #[serde(default)]
    pub active_hours: ActiveHours,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub rules: Vec<GateRule>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn default_rollout() -> f64 {
    100.0
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rollout_percentage: 100.0,
            default_arm_id: None,
            schedule: ScheduleWindow::default(),
            active_hours: ActiveHours::default(),
            timezone: default_timezone(),
            rules: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

impl GateConfig {
    /// Write-time validation: rollout bounds and a resolvable timezone.
    /// Operator validity is enforced by deserialization.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.rollout_percentage) {
            return Err(Error::InvalidArgument(format!(
                "rollout_percentage must be in [0, 100], got {}",
                self.rollout_percentage
            )));
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(Error::InvalidArgument(format!(
                "unknown timezone: {}",
                self.timezone
            )));
        }
        Ok(())
    }
}
