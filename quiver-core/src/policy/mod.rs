//! Bandit policy family.
//!
//! Each policy is a pure module behind the [`Policy`] trait: deterministic
//! `init_params`, `select` that is pure except for the injected RNG, and
//! `train` that returns a fresh state without touching the old one (in-flight
//! readers keep a consistent snapshot). Policies are looked up by name in a
//! [`PolicyRegistry`] built at process init.

pub mod adversarial;
pub mod contextual;
pub mod state;
pub mod stochastic;

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Error, Result};

pub use state::ParamState;

pub trait Policy: Send + Sync {
    /// Registry name; also the serde tag of the matching [`ParamState`]
    /// variant.
    fn name(&self) -> &'static str;

    /// Deterministic fresh state for `num_arms` arms. `overrides` carries the
    /// experiment's policy params; unknown keys are ignored, missing required
    /// keys or out-of-range values are `InvalidArgument`.
    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState>;

    /// Pick an arm index in `[0, num_arms)`. Never out of range.
    fn select(&self, ps: &ParamState, ctx: &Context, rng: &mut dyn RngCore) -> Result<usize>;

    /// Fold one observed reward into a new state. Only the chosen arm's
    /// entries and scalar counters change; arrays never shrink.
    fn train(&self, ps: &ParamState, ctx: &Context, arm: usize, reward: f64) -> Result<ParamState>;
}

/// Explicit `name -> policy` table. No reflection: every policy is
/// registered here at construction.
pub struct PolicyRegistry {
    policies: HashMap<&'static str, Arc<dyn Policy>>,
}

impl PolicyRegistry {
    /// Registry holding all built-in policies.
    pub fn builtin() -> Self {
        let mut registry = Self {
            policies: HashMap::new(),
        };
        registry.register(Arc::new(stochastic::BetaTs));
        registry.register(Arc::new(stochastic::GaussianTs));
        registry.register(Arc::new(stochastic::Ucb1Tuned));
        registry.register(Arc::new(stochastic::KlUcb));
        registry.register(Arc::new(stochastic::KlUcbPlus));
        registry.register(Arc::new(stochastic::EpsilonGreedy));
        registry.register(Arc::new(stochastic::Moss));
        registry.register(Arc::new(stochastic::MossAnytime));
        registry.register(Arc::new(contextual::LinUcb));
        registry.register(Arc::new(contextual::LinTs));
        registry.register(Arc::new(adversarial::Exp3));
        registry.register(Arc::new(adversarial::Fpl));
        registry
    }

    pub fn register(&mut self, policy: Arc<dyn Policy>) {
        self.policies.insert(policy.name(), policy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Policy>> {
        self.policies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.policies.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

pub(crate) fn parse_overrides<T: DeserializeOwned>(
    policy: &str,
    overrides: &Map<String, Value>,
) -> Result<T> {
    serde_json::from_value(Value::Object(overrides.clone()))
        .map_err(|e| Error::InvalidArgument(format!("{policy} policy params: {e}")))
}

pub(crate) fn state_mismatch(policy: &str, ps: &ParamState) -> Error {
    Error::Internal(format!(
        "policy {policy} received {} parameter state",
        ps.policy_name()
    ))
}

pub(crate) fn check_arm(ps: &ParamState, arm: usize) -> Result<()> {
    if arm >= ps.num_arms() {
        return Err(Error::InvalidArgument(format!(
            "arm index {arm} out of range for {} arms",
            ps.num_arms()
        )));
    }
    Ok(())
}

/// Incremental empirical-mean update used by the frequentist policies.
pub(crate) fn incremental_mean(mean: f64, reward: f64, pulls_after: u64) -> f64 {
    mean + (reward - mean) / pulls_after as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn builtin_registry_has_all_policies() {
        let registry = PolicyRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec![
                "beta_ts",
                "epsilon_greedy",
                "exp3",
                "fpl",
                "gaussian_ts",
                "kl_ucb",
                "kl_ucb_plus",
                "lin_ts",
                "lin_ucb",
                "moss",
                "moss_anytime",
                "ucb1_tuned",
            ]
        );
    }

    #[test]
    fn every_policy_selects_in_range() {
        let registry = PolicyRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(7);
        let ctx = Context::new("c").with_vector(vec![0.3, -0.1, 0.8]);
        for name in registry.names() {
            let policy = registry.get(name).unwrap();
            let overrides = match name {
                "epsilon_greedy" => params(&[("epsilon", 0.2.into()), ("decay", 0.01.into())]),
                "moss" => params(&[("horizon", 1000.into())]),
                "lin_ucb" | "lin_ts" => params(&[("dim", 3.into())]),
                _ => Map::new(),
            };
            let mut ps = policy.init_params(5, &overrides).unwrap();
            assert_eq!(ps.num_arms(), 5, "{name}");
            for round in 0..50 {
                let arm = policy.select(&ps, &ctx, &mut rng).unwrap();
                assert!(arm < 5, "{name} returned arm {arm}");
                let reward = if round % 3 == 0 { 1.0 } else { 0.0 };
                ps = policy.train(&ps, &ctx, arm, reward).unwrap();
            }
        }
    }

    #[test]
    fn every_state_roundtrips_through_json() {
        let registry = PolicyRegistry::builtin();
        let mut rng = StdRng::seed_from_u64(11);
        let ctx = Context::new("c").with_vector(vec![1.0, 2.0]);
        for name in registry.names() {
            let policy = registry.get(name).unwrap();
            let overrides = match name {
                "epsilon_greedy" => params(&[("epsilon", 0.1.into()), ("decay", 0.0.into())]),
                "moss" => params(&[("horizon", 64.into())]),
                "lin_ucb" | "lin_ts" => params(&[("dim", 2.into())]),
                _ => Map::new(),
            };
            let mut ps = policy.init_params(3, &overrides).unwrap();
            let arm = policy.select(&ps, &ctx, &mut rng).unwrap();
            ps = policy.train(&ps, &ctx, arm, 0.7).unwrap();

            let blob = serde_json::to_string(&ps).unwrap();
            let back: ParamState = serde_json::from_str(&blob).unwrap();
            back.validate().unwrap();
            assert_eq!(back, ps, "{name} state did not round-trip");
        }
    }

    #[test]
    fn train_rejects_out_of_range_arm() {
        let policy = stochastic::BetaTs;
        let ps = policy.init_params(2, &Map::new()).unwrap();
        let err = policy
            .train(&ps, &Context::new("c"), 2, 1.0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn state_mismatch_is_internal() {
        let beta = stochastic::BetaTs;
        let fpl_state = adversarial::Fpl.init_params(2, &Map::new()).unwrap();
        let err = beta
            .select(&fpl_state, &Context::new("c"), &mut StdRng::seed_from_u64(1))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
