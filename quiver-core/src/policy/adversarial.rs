//! Adversarial-bandit policies: EXP3 (exponential weights with importance
//! weighting) and FPL (follow the perturbed leader).

use rand::distributions::WeightedIndex;
use rand::RngCore;
use rand_distr::{Distribution, Exp};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::linalg::argmax;

use super::state::{Exp3State, FplState, ParamState};
use super::{check_arm, parse_overrides, state_mismatch, Policy};

// ---------------------------------------------------------------------------
// EXP3
// ---------------------------------------------------------------------------

pub struct Exp3;

#[derive(Deserialize)]
struct Exp3Overrides {
    #[serde(default = "default_exp3_gamma")]
    gamma: f64,
}

fn default_exp3_gamma() -> f64 {
    0.1
}

/// Mixture of the normalized weights and the uniform exploration floor:
/// `p_j = (1 - gamma) * w_j / sum(w) + gamma / K`.
fn probabilities(s: &Exp3State) -> Vec<f64> {
    let total: f64 = s.weights.iter().sum();
    let k = s.num_arms as f64;
    s.weights
        .iter()
        .map(|w| (1.0 - s.gamma) * (w / total) + s.gamma / k)
        .collect()
}

impl Policy for Exp3 {
    fn name(&self) -> &'static str {
        "exp3"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: Exp3Overrides = parse_overrides(self.name(), overrides)?;
        if !(0.0..=1.0).contains(&o.gamma) {
            return Err(Error::InvalidArgument(
                "exp3 gamma must be in [0, 1]".into(),
            ));
        }
        Ok(ParamState::Exp3(Exp3State {
            num_arms,
            gamma: o.gamma,
            weights: vec![1.0; num_arms],
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::Exp3(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let probs = probabilities(s);
        let dist = WeightedIndex::new(&probs)
            .map_err(|e| Error::Internal(format!("exp3 weights degenerate: {e}")))?;
        Ok(dist.sample(&mut *rng))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::Exp3(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let probs = probabilities(s);
        let mut next = s.clone();
        // Importance-weighted estimate for the played arm only.
        let estimate = reward / probs[arm];
        next.weights[arm] *= (estimate * s.gamma / s.num_arms as f64).exp();
        // Normalize to sum 1 each step to keep the weights bounded.
        let total: f64 = next.weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            for w in &mut next.weights {
                *w /= total;
            }
        }
        Ok(ParamState::Exp3(next))
    }
}

// ---------------------------------------------------------------------------
// FPL
// ---------------------------------------------------------------------------

pub struct Fpl;

#[derive(Deserialize)]
struct FplOverrides {
    #[serde(default = "default_fpl_eta")]
    eta: f64,
}

fn default_fpl_eta() -> f64 {
    5.0
}

impl Policy for Fpl {
    fn name(&self) -> &'static str {
        "fpl"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: FplOverrides = parse_overrides(self.name(), overrides)?;
        if o.eta <= 0.0 {
            return Err(Error::InvalidArgument("fpl eta must be positive".into()));
        }
        Ok(ParamState::Fpl(FplState {
            num_arms,
            eta: o.eta,
            rewards: vec![0.0; num_arms],
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::Fpl(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        // Fresh exponential perturbation with mean eta per arm, per call.
        let dist = Exp::new(1.0 / s.eta)
            .map_err(|e| Error::Internal(format!("fpl perturbation: {e}")))?;
        let perturbed: Vec<f64> = s
            .rewards
            .iter()
            .map(|r| r + dist.sample(&mut *rng))
            .collect();
        Ok(argmax(&perturbed))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::Fpl(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        next.rewards[arm] += reward;
        Ok(ParamState::Fpl(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn exp3_probabilities_sum_to_one() {
        let s = Exp3State {
            num_arms: 4,
            gamma: 0.2,
            weights: vec![0.1, 0.2, 0.3, 0.4],
        };
        let probs = probabilities(&s);
        let total: f64 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(probs.iter().all(|&p| p >= 0.2 / 4.0));
    }

    #[test]
    fn exp3_train_normalizes_and_boosts_winner() {
        let policy = Exp3;
        let ps = policy.init_params(3, &Map::new()).unwrap();
        let next = policy.train(&ps, &Context::new("c"), 1, 1.0).unwrap();
        match next {
            ParamState::Exp3(s) => {
                let total: f64 = s.weights.iter().sum();
                assert!((total - 1.0).abs() < 1e-12);
                assert!(s.weights[1] > s.weights[0]);
                assert_eq!(s.weights[0], s.weights[2]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn exp3_concentrates_on_rewarding_arm() {
        let policy = Exp3;
        let mut rng = StdRng::seed_from_u64(17);
        let ctx = Context::new("c");
        let mut ps = policy.init_params(3, &Map::new()).unwrap();
        for _ in 0..200 {
            let arm = policy.select(&ps, &ctx, &mut rng).unwrap();
            let reward = if arm == 2 { 1.0 } else { 0.0 };
            ps = policy.train(&ps, &ctx, arm, reward).unwrap();
        }
        match ps {
            ParamState::Exp3(s) => assert!(s.weights[2] > s.weights[0]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn fpl_accumulates_rewards_without_noise() {
        let policy = Fpl;
        let ps = policy.init_params(2, &Map::new()).unwrap();
        let next = policy.train(&ps, &Context::new("c"), 0, 2.5).unwrap();
        match next {
            ParamState::Fpl(s) => assert_eq!(s.rewards, vec![2.5, 0.0]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn fpl_follows_a_dominant_leader() {
        let policy = Fpl;
        let mut overrides = Map::new();
        overrides.insert("eta".into(), 0.5.into());
        let mut ps = policy.init_params(2, &overrides).unwrap();
        let ctx = Context::new("c");
        for _ in 0..100 {
            ps = policy.train(&ps, &ctx, 1, 1.0).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(23);
        let picks: Vec<usize> = (0..50)
            .map(|_| policy.select(&ps, &ctx, &mut rng).unwrap())
            .collect();
        assert!(picks.iter().filter(|&&a| a == 1).count() > 45);
    }
}
