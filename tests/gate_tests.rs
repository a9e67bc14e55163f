// Feature-gate behavior across restarts and configurations.

use std::collections::HashMap;

use quiver_core::gate::{ActiveHours, GateConfig, GateRule, RuleOperator, ScheduleWindow};
use quiver_proxy::gate::FeatureGate;
use serde_json::json;

fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn rollout_verdict_is_identical_across_instances() {
    // Two independently constructed configs stand in for two processes; the
    // verdict for the same context id must agree, and survive "restarts".
    let make_config = || GateConfig {
        rollout_percentage: 50.0,
        default_arm_id: Some("held-back".to_string()),
        ..GateConfig::default()
    };
    for id in ["user-42", "user-1729", "a", "b", "c", "zzz"] {
        let first = FeatureGate::evaluate(&make_config(), id, &HashMap::new());
        let second = FeatureGate::evaluate(&make_config(), id, &HashMap::new());
        assert_eq!(first, second, "verdict changed for {id}");
        let bucket = FeatureGate::rollout_bucket(id);
        assert_eq!(bucket, FeatureGate::rollout_bucket(id));
        // The verdict follows the bucket.
        let expected_held_back = bucket as f64 >= 50.0;
        assert_eq!(first.is_some(), expected_held_back, "{id}");
    }
}

#[test]
fn rollout_population_is_roughly_split() {
    let mut included = 0usize;
    let total = 1000usize;
    for i in 0..total {
        if FeatureGate::rollout_bucket(&format!("user-{i}")) < 50 {
            included += 1;
        }
    }
    // SHA-256 buckets should not be pathologically skewed.
    assert!((300..=700).contains(&included), "included: {included}");
}

#[test]
fn disabled_beats_rules() {
    let config = GateConfig {
        enabled: false,
        default_arm_id: Some("default".to_string()),
        rules: vec![GateRule {
            key: "tier".to_string(),
            operator: RuleOperator::Eq,
            value: json!("gold"),
            committed_arm_id: Some("gold-arm".to_string()),
        }],
        ..GateConfig::default()
    };
    // Even a matching rule is not consulted once a state flag fires.
    assert_eq!(
        FeatureGate::evaluate(&config, "c", &meta(&[("tier", "gold")])),
        Some("default".to_string())
    );
}

#[test]
fn schedule_blackout_returns_default() {
    let config = GateConfig {
        schedule: ScheduleWindow {
            start: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            end: None,
        },
        default_arm_id: Some("before-launch".to_string()),
        ..GateConfig::default()
    };
    assert_eq!(
        FeatureGate::evaluate(&config, "c", &HashMap::new()),
        Some("before-launch".to_string())
    );
}

#[test]
fn active_hours_with_single_endpoint_do_not_constrain() {
    let config = GateConfig {
        active_hours: ActiveHours {
            start: Some(chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
            end: None,
        },
        default_arm_id: Some("d".to_string()),
        ..GateConfig::default()
    };
    assert!(!FeatureGate::render_flags(&config, "c").blackout);
}

#[test]
fn matched_rule_without_arm_proceeds_to_bandit() {
    let config = GateConfig {
        rules: vec![GateRule {
            key: "tier".to_string(),
            operator: RuleOperator::Eq,
            value: json!("gold"),
            committed_arm_id: None,
        }],
        ..GateConfig::default()
    };
    assert_eq!(
        FeatureGate::evaluate(&config, "c", &meta(&[("tier", "gold")])),
        None
    );
}

#[test]
fn rule_aliases_parse_and_evaluate() {
    let config: GateConfig = serde_json::from_value(json!({
        "rules": [
            {"key": "age", "operator": ">=", "value": 21, "committed_arm_id": "adult"},
            {"key": "tier", "operator": "equals", "value": "gold", "committed_arm_id": "gold"}
        ]
    }))
    .unwrap();
    assert_eq!(
        FeatureGate::evaluate(&config, "c", &meta(&[("age", "30")])),
        Some("adult".to_string())
    );
    assert_eq!(
        FeatureGate::evaluate(&config, "c", &meta(&[("age", "18"), ("tier", "gold")])),
        Some("gold".to_string())
    );
}

#[test]
fn unknown_timezone_fails_validation_but_not_evaluation() {
    let mut config = GateConfig {
        timezone: "Not/AZone".to_string(),
        ..GateConfig::default()
    };
    assert!(config.validate().is_err());
    // Evaluation falls back to UTC rather than erroring.
    config.default_arm_id = Some("d".to_string());
    let _ = FeatureGate::evaluate(&config, "c", &HashMap::new());

    config.timezone = "America/New_York".to_string();
    assert!(config.validate().is_ok());
}

#[test]
fn gate_config_roundtrips_through_json() {
    let config = GateConfig {
        enabled: true,
        rollout_percentage: 25.0,
        default_arm_id: Some("arm-a".to_string()),
        timezone: "Asia/Tokyo".to_string(),
        active_hours: ActiveHours {
            start: chrono::NaiveTime::from_hms_opt(9, 0, 0),
            end: chrono::NaiveTime::from_hms_opt(18, 0, 0),
        },
        rules: vec![GateRule {
            key: "country".to_string(),
            operator: RuleOperator::In,
            value: json!(["jp", "kr"]),
            committed_arm_id: Some("apac".to_string()),
        }],
        ..GateConfig::default()
    };
    let blob = serde_json::to_string(&config).unwrap();
    let back: GateConfig = serde_json::from_str(&blob).unwrap();
    assert_eq!(back, config);
}
