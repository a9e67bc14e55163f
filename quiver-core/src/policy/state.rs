//! Learned parameter state, one variant per policy.
//!
//! The state is a tagged union so a stored blob knows which policy owns it;
//! JSON (de)serialization goes through serde and is validated once at load
//! time via [`ParamState::validate`]. Every array-valued field has length
//! `num_arms`, fixed at init for the life of the state.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ParamState {
    BetaTs(BetaTsState),
    GaussianTs(GaussianTsState),
    Ucb1Tuned(Ucb1TunedState),
    KlUcb(KlUcbState),
    KlUcbPlus(KlUcbState),
    EpsilonGreedy(EpsilonGreedyState),
    Moss(MossState),
    MossAnytime(MossAnytimeState),
    LinUcb(LinearState),
    LinTs(LinearState),
    Exp3(Exp3State),
    Fpl(FplState),
}

impl ParamState {
    pub fn num_arms(&self) -> usize {
        match self {
            ParamState::BetaTs(s) => s.num_arms,
            ParamState::GaussianTs(s) => s.num_arms,
            ParamState::Ucb1Tuned(s) => s.num_arms,
            ParamState::KlUcb(s) | ParamState::KlUcbPlus(s) => s.num_arms,
            ParamState::EpsilonGreedy(s) => s.num_arms,
            ParamState::Moss(s) => s.num_arms,
            ParamState::MossAnytime(s) => s.num_arms,
            ParamState::LinUcb(s) | ParamState::LinTs(s) => s.num_arms,
            ParamState::Exp3(s) => s.num_arms,
            ParamState::Fpl(s) => s.num_arms,
        }
    }

    /// The serde tag naming the owning policy.
    pub fn policy_name(&self) -> &'static str {
        match self {
            ParamState::BetaTs(_) => "beta_ts",
            ParamState::GaussianTs(_) => "gaussian_ts",
            ParamState::Ucb1Tuned(_) => "ucb1_tuned",
            ParamState::KlUcb(_) => "kl_ucb",
            ParamState::KlUcbPlus(_) => "kl_ucb_plus",
            ParamState::EpsilonGreedy(_) => "epsilon_greedy",
            ParamState::Moss(_) => "moss",
            ParamState::MossAnytime(_) => "moss_anytime",
            ParamState::LinUcb(_) => "lin_ucb",
            ParamState::LinTs(_) => "lin_ts",
            ParamState::Exp3(_) => "exp3",
            ParamState::Fpl(_) => "fpl",
        }
    }

    /// Structural check run once when a stored state is loaded: every
    /// array-valued field must have length `num_arms`.
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            ParamState::BetaTs(s) => {
                s.alpha.len() == s.num_arms
                    && s.beta.len() == s.num_arms
                    && s.pulls.len() == s.num_arms
            }
            ParamState::GaussianTs(s) => {
                s.mean.len() == s.num_arms
                    && s.precision.len() == s.num_arms
                    && s.pulls.len() == s.num_arms
            }
            ParamState::Ucb1Tuned(s) => {
                s.mean.len() == s.num_arms
                    && s.pulls.len() == s.num_arms
                    && s.reward_sq.len() == s.num_arms
            }
            ParamState::KlUcb(s) | ParamState::KlUcbPlus(s) => {
                s.reward_sum.len() == s.num_arms && s.pulls.len() == s.num_arms
            }
            ParamState::EpsilonGreedy(s) => {
                s.mean.len() == s.num_arms && s.pulls.len() == s.num_arms
            }
            ParamState::Moss(s) => s.mean.len() == s.num_arms && s.pulls.len() == s.num_arms,
            ParamState::MossAnytime(s) => {
                s.mean.len() == s.num_arms && s.pulls.len() == s.num_arms
            }
            ParamState::LinUcb(s) | ParamState::LinTs(s) => {
                s.design.len() == s.num_arms
                    && s.response.len() == s.num_arms
                    && s.design
                        .iter()
                        .all(|d| d.nrows() == s.dim && d.ncols() == s.dim)
                    && s.response.iter().all(|r| r.len() == s.dim)
            }
            ParamState::Exp3(s) => s.weights.len() == s.num_arms,
            ParamState::Fpl(s) => s.rewards.len() == s.num_arms,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Serialization(format!(
                "{} parameter state has arrays inconsistent with num_arms={}",
                self.policy_name(),
                self.num_arms()
            )))
        }
    }
}

/// Beta-Bernoulli Thompson sampling: conjugate Beta posteriors over binary
/// rewards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaTsState {
    pub num_arms: usize,
    pub alpha_prior: f64,
    pub beta_prior: f64,
    pub alpha: Vec<f64>,
    pub beta: Vec<f64>,
    pub pulls: Vec<u64>,
}

/// Gaussian Thompson sampling: Gaussian-Gaussian conjugacy with known noise
/// precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianTsState {
    pub num_arms: usize,
    pub prior_mean: f64,
    pub prior_precision: f64,
    pub noise_precision: f64,
    pub mean: Vec<f64>,
    pub precision: Vec<f64>,
    pub pulls: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ucb1TunedState {
    pub num_arms: usize,
    pub alpha: f64,
    pub mean: Vec<f64>,
    pub pulls: Vec<u64>,
    pub reward_sq: Vec<f64>,
    pub round: u64,
}

/// Shared by KL-UCB and KL-UCB+ (they differ only in the exploration
/// threshold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlUcbState {
    pub num_arms: usize,
    pub c: f64,
    pub reward_sum: Vec<f64>,
    pub pulls: Vec<u64>,
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsilonGreedyState {
    pub num_arms: usize,
    pub epsilon: f64,
    pub decay: f64,
    pub mean: Vec<f64>,
    pub pulls: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MossState {
    pub num_arms: usize,
    pub horizon: u64,
    pub mean: Vec<f64>,
    pub pulls: Vec<u64>,
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MossAnytimeState {
    pub num_arms: usize,
    pub mean: Vec<f64>,
    pub pulls: Vec<u64>,
    pub round: u64,
}

/// Ridge-regression state shared by LinUCB and LinTS: per-arm design matrix
/// (identity-initialized) and reward-weighted context sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearState {
    pub num_arms: usize,
    pub dim: usize,
    /// Exploration scale: LinUCB's confidence multiplier, LinTS's posterior
    /// variance scale.
    pub scale: f64,
    pub design: Vec<Array2<f64>>,
    pub response: Vec<Array1<f64>>,
}

impl LinearState {
    pub fn identity(num_arms: usize, dim: usize, scale: f64) -> Self {
        Self {
            num_arms,
            dim,
            scale,
            design: (0..num_arms).map(|_| Array2::eye(dim)).collect(),
            response: (0..num_arms).map(|_| Array1::zeros(dim)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exp3State {
    pub num_arms: usize,
    pub gamma: f64,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FplState {
    pub num_arms: usize,
    pub eta: f64,
    pub rewards: Vec<f64>,
}
