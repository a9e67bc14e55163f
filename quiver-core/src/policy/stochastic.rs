//! Stochastic-bandit policies: Thompson sampling (Beta and Gaussian), the
//! UCB family (UCB1-Tuned, KL-UCB, KL-UCB+), epsilon-greedy, and MOSS.

use rand::{Rng, RngCore};
use rand_distr::{Beta as BetaDist, Distribution, Normal};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::linalg::argmax;

use super::state::{
    BetaTsState, EpsilonGreedyState, GaussianTsState, KlUcbState, MossAnytimeState, MossState,
    ParamState, Ucb1TunedState,
};
use super::{check_arm, incremental_mean, parse_overrides, state_mismatch, Policy};

fn default_one() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Beta-Bernoulli Thompson sampling
// ---------------------------------------------------------------------------

pub struct BetaTs;

#[derive(Deserialize)]
struct BetaTsOverrides {
    #[serde(default = "default_one")]
    alpha_prior: f64,
    #[serde(default = "default_one")]
    beta_prior: f64,
}

impl Policy for BetaTs {
    fn name(&self) -> &'static str {
        "beta_ts"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: BetaTsOverrides = parse_overrides(self.name(), overrides)?;
        if o.alpha_prior <= 0.0 || o.beta_prior <= 0.0 {
            return Err(Error::InvalidArgument(
                "beta_ts priors must be positive".into(),
            ));
        }
        Ok(ParamState::BetaTs(BetaTsState {
            num_arms,
            alpha_prior: o.alpha_prior,
            beta_prior: o.beta_prior,
            alpha: vec![o.alpha_prior; num_arms],
            beta: vec![o.beta_prior; num_arms],
            pulls: vec![0; num_arms],
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::BetaTs(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let mut samples = Vec::with_capacity(s.num_arms);
        for i in 0..s.num_arms {
            let dist = BetaDist::new(s.alpha[i], s.beta[i])
                .map_err(|e| Error::Internal(format!("beta sample: {e}")))?;
            samples.push(dist.sample(&mut *rng));
        }
        Ok(argmax(&samples))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::BetaTs(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        // Binarize: success iff reward > 0.5.
        let success = reward > 0.5;
        next.pulls[arm] += 1;
        if success {
            next.alpha[arm] += 1.0;
        } else {
            next.beta[arm] += 1.0;
        }
        Ok(ParamState::BetaTs(next))
    }
}

// ---------------------------------------------------------------------------
// Gaussian Thompson sampling
// ---------------------------------------------------------------------------

pub struct GaussianTs;

#[derive(Deserialize)]
struct GaussianTsOverrides {
    #[serde(default)]
    prior_mean: f64,
    #[serde(default = "default_one")]
    prior_precision: f64,
    #[serde(default = "default_one")]
    noise_precision: f64,
}

impl Policy for GaussianTs {
    fn name(&self) -> &'static str {
        "gaussian_ts"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: GaussianTsOverrides = parse_overrides(self.name(), overrides)?;
        if o.prior_precision <= 0.0 || o.noise_precision <= 0.0 {
            return Err(Error::InvalidArgument(
                "gaussian_ts precisions must be positive".into(),
            ));
        }
        Ok(ParamState::GaussianTs(GaussianTsState {
            num_arms,
            prior_mean: o.prior_mean,
            prior_precision: o.prior_precision,
            noise_precision: o.noise_precision,
            mean: vec![o.prior_mean; num_arms],
            precision: vec![o.prior_precision; num_arms],
            pulls: vec![0; num_arms],
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::GaussianTs(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let mut samples = Vec::with_capacity(s.num_arms);
        for i in 0..s.num_arms {
            let sd = 1.0 / s.precision[i].sqrt();
            let dist = Normal::new(s.mean[i], sd)
                .map_err(|e| Error::Internal(format!("normal sample: {e}")))?;
            samples.push(dist.sample(&mut *rng));
        }
        Ok(argmax(&samples))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::GaussianTs(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        next.pulls[arm] += 1;
        let tau = s.precision[arm];
        let tau_next = tau + s.noise_precision;
        next.mean[arm] = (tau * s.mean[arm] + s.noise_precision * reward) / tau_next;
        next.precision[arm] = tau_next;
        Ok(ParamState::GaussianTs(next))
    }
}

// ---------------------------------------------------------------------------
// UCB1-Tuned
// ---------------------------------------------------------------------------

pub struct Ucb1Tuned;

#[derive(Deserialize)]
struct Ucb1TunedOverrides {
    #[serde(default = "default_ucb_alpha")]
    alpha: f64,
}

fn default_ucb_alpha() -> f64 {
    2.0
}

fn ucb1_tuned_bound(s: &Ucb1TunedState, arm: usize) -> f64 {
    if s.pulls[arm] == 0 {
        return f64::INFINITY;
    }
    let t = s.pulls[arm] as f64;
    let log_round = ((s.round + 1) as f64).ln();
    // Variance upper bound: empirical variance plus its confidence slack.
    let variance = s.reward_sq[arm] / t - s.mean[arm] * s.mean[arm];
    let slack = (s.alpha * log_round / t).sqrt();
    let sigma_bound = f64::min(0.25, (variance + slack).max(0.0));
    s.mean[arm] + (sigma_bound * log_round / t).sqrt()
}

impl Policy for Ucb1Tuned {
    fn name(&self) -> &'static str {
        "ucb1_tuned"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: Ucb1TunedOverrides = parse_overrides(self.name(), overrides)?;
        if o.alpha <= 0.0 {
            return Err(Error::InvalidArgument(
                "ucb1_tuned alpha must be positive".into(),
            ));
        }
        Ok(ParamState::Ucb1Tuned(Ucb1TunedState {
            num_arms,
            alpha: o.alpha,
            mean: vec![0.0; num_arms],
            pulls: vec![0; num_arms],
            reward_sq: vec![0.0; num_arms],
            round: 0,
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, _rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::Ucb1Tuned(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let bounds: Vec<f64> = (0..s.num_arms).map(|i| ucb1_tuned_bound(s, i)).collect();
        Ok(argmax(&bounds))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::Ucb1Tuned(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        next.pulls[arm] += 1;
        next.reward_sq[arm] += reward * reward;
        next.mean[arm] = incremental_mean(s.mean[arm], reward, next.pulls[arm]);
        next.round += 1;
        Ok(ParamState::Ucb1Tuned(next))
    }
}

// ---------------------------------------------------------------------------
// KL-UCB and KL-UCB+
// ---------------------------------------------------------------------------

const KL_TOLERANCE: f64 = 1e-6;
const KL_MAX_ITERATIONS: usize = 50;

/// KL divergence between Bernoulli(p) and Bernoulli(q).
fn kl_bernoulli(p: f64, q: f64) -> f64 {
    let p = p.clamp(0.0, 1.0);
    let q = q.clamp(0.0, 1.0);
    if p == 0.0 {
        if q == 1.0 {
            return f64::INFINITY;
        }
        return -(1.0 - q).ln();
    }
    if p == 1.0 {
        if q == 0.0 {
            return f64::INFINITY;
        }
        return -q.ln();
    }
    if q == 0.0 || q == 1.0 {
        return f64::INFINITY;
    }
    p * (p / q).ln() + (1.0 - p) * ((1.0 - p) / (1.0 - q)).ln()
}

/// Largest q in [p_hat, 1] with `N * d(p_hat, q) <= threshold * N`, found by
/// bisection.
fn kl_ucb_bound(s: &KlUcbState, arm: usize, t: f64, plus: bool) -> f64 {
    if s.pulls[arm] == 0 {
        return f64::INFINITY;
    }
    let n = s.pulls[arm] as f64;
    let p_hat = s.reward_sum[arm] / n;

    let threshold = if plus {
        // KL-UCB+ explores with ln(t / N) in place of ln(t).
        let ratio = (t / n).max(1.0);
        let log_ratio = ratio.ln();
        if log_ratio <= 0.0 {
            return p_hat;
        }
        let log_log = if log_ratio > 1.0 { log_ratio.ln() } else { 0.0 };
        (log_ratio + s.c * log_log) / n
    } else {
        if t <= 1.0 {
            0.0
        } else {
            let log_t = t.ln();
            let log_log = if log_t > 1.0 { log_t.ln() } else { 0.0 };
            (log_t + s.c * log_log) / n
        }
    };

    if threshold < 1e-10 {
        return p_hat;
    }

    let mut left = p_hat;
    let mut right = 1.0;
    if kl_bernoulli(p_hat, right) <= threshold {
        return right;
    }
    for _ in 0..KL_MAX_ITERATIONS {
        let mid = (left + right) / 2.0;
        let div = kl_bernoulli(p_hat, mid);
        if (div - threshold).abs() < KL_TOLERANCE {
            return mid;
        }
        if div < threshold {
            left = mid;
        } else {
            right = mid;
        }
        if (right - left).abs() < KL_TOLERANCE {
            break;
        }
    }
    (left + right) / 2.0
}

#[derive(Deserialize)]
struct KlUcbOverrides {
    #[serde(default)]
    c: f64,
}

fn kl_ucb_init(num_arms: usize, overrides: &Map<String, Value>, name: &str) -> Result<KlUcbState> {
    let o: KlUcbOverrides = parse_overrides(name, overrides)?;
    if o.c < 0.0 {
        return Err(Error::InvalidArgument(format!(
            "{name} c must be non-negative"
        )));
    }
    Ok(KlUcbState {
        num_arms,
        c: o.c,
        reward_sum: vec![0.0; num_arms],
        pulls: vec![0; num_arms],
        round: 0,
    })
}

fn kl_ucb_train(s: &KlUcbState, arm: usize, reward: f64) -> KlUcbState {
    let mut next = s.clone();
    next.pulls[arm] += 1;
    next.reward_sum[arm] += reward.clamp(0.0, 1.0);
    next.round += 1;
    next
}

pub struct KlUcb;

impl Policy for KlUcb {
    fn name(&self) -> &'static str {
        "kl_ucb"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        Ok(ParamState::KlUcb(kl_ucb_init(
            num_arms,
            overrides,
            self.name(),
        )?))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, _rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::KlUcb(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let t = (s.round + 1) as f64;
        let bounds: Vec<f64> = (0..s.num_arms)
            .map(|i| kl_ucb_bound(s, i, t, false))
            .collect();
        Ok(argmax(&bounds))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::KlUcb(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        Ok(ParamState::KlUcb(kl_ucb_train(s, arm, reward)))
    }
}

pub struct KlUcbPlus;

impl Policy for KlUcbPlus {
    fn name(&self) -> &'static str {
        "kl_ucb_plus"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        Ok(ParamState::KlUcbPlus(kl_ucb_init(
            num_arms,
            overrides,
            self.name(),
        )?))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, _rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::KlUcbPlus(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let t = (s.round + 1) as f64;
        let bounds: Vec<f64> = (0..s.num_arms)
            .map(|i| kl_ucb_bound(s, i, t, true))
            .collect();
        Ok(argmax(&bounds))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::KlUcbPlus(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        Ok(ParamState::KlUcbPlus(kl_ucb_train(s, arm, reward)))
    }
}

// ---------------------------------------------------------------------------
// Epsilon-greedy with exponential decay
// ---------------------------------------------------------------------------

pub struct EpsilonGreedy;

#[derive(Deserialize)]
struct EpsilonGreedyOverrides {
    epsilon: f64,
    decay: f64,
}

impl Policy for EpsilonGreedy {
    fn name(&self) -> &'static str {
        "epsilon_greedy"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: EpsilonGreedyOverrides = parse_overrides(self.name(), overrides)?;
        if !(0.0..=1.0).contains(&o.epsilon) || !(0.0..=1.0).contains(&o.decay) {
            return Err(Error::InvalidArgument(
                "epsilon_greedy epsilon and decay must be in [0, 1]".into(),
            ));
        }
        Ok(ParamState::EpsilonGreedy(EpsilonGreedyState {
            num_arms,
            epsilon: o.epsilon,
            decay: o.decay,
            mean: vec![0.0; num_arms],
            pulls: vec![0; num_arms],
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::EpsilonGreedy(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        if rng.gen::<f64>() > s.epsilon {
            Ok(argmax(&s.mean))
        } else {
            Ok(rng.gen_range(0..s.num_arms))
        }
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::EpsilonGreedy(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        next.pulls[arm] += 1;
        next.mean[arm] = incremental_mean(s.mean[arm], reward, next.pulls[arm]);
        // Exponential decay: epsilon <- epsilon * (1 - decay).
        next.epsilon = s.epsilon * (1.0 - s.decay);
        Ok(ParamState::EpsilonGreedy(next))
    }
}

// ---------------------------------------------------------------------------
// MOSS and anytime MOSS
// ---------------------------------------------------------------------------

/// MOSS index: `mu_i + sqrt(max(ln(n / (K * T_i)), 0) / T_i)`.
fn moss_index(mean: f64, pulls: u64, horizon: f64, num_arms: usize) -> f64 {
    if pulls == 0 {
        return f64::INFINITY;
    }
    let t = pulls as f64;
    let k = num_arms as f64;
    let log_term = if horizon > k * t {
        (horizon / (k * t)).ln()
    } else {
        0.0
    };
    mean + (log_term.max(0.0) / t).sqrt()
}

pub struct Moss;

#[derive(Deserialize)]
struct MossOverrides {
    horizon: u64,
}

impl Policy for Moss {
    fn name(&self) -> &'static str {
        "moss"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: MossOverrides = parse_overrides(self.name(), overrides)?;
        if o.horizon == 0 {
            return Err(Error::InvalidArgument("moss horizon must be positive".into()));
        }
        Ok(ParamState::Moss(MossState {
            num_arms,
            horizon: o.horizon,
            mean: vec![0.0; num_arms],
            pulls: vec![0; num_arms],
            round: 0,
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, _rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::Moss(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let indices: Vec<f64> = (0..s.num_arms)
            .map(|i| moss_index(s.mean[i], s.pulls[i], s.horizon as f64, s.num_arms))
            .collect();
        Ok(argmax(&indices))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::Moss(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        next.pulls[arm] += 1;
        next.mean[arm] = incremental_mean(s.mean[arm], reward, next.pulls[arm]);
        next.round += 1;
        Ok(ParamState::Moss(next))
    }
}

pub struct MossAnytime;

impl Policy for MossAnytime {
    fn name(&self) -> &'static str {
        "moss_anytime"
    }

    fn init_params(&self, num_arms: usize, _overrides: &Map<String, Value>) -> Result<ParamState> {
        Ok(ParamState::MossAnytime(MossAnytimeState {
            num_arms,
            mean: vec![0.0; num_arms],
            pulls: vec![0; num_arms],
            round: 0,
        }))
    }

    fn select(&self, ps: &ParamState, _ctx: &Context, _rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::MossAnytime(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        // Current round stands in for the unknown horizon.
        let horizon = s.round.max(1) as f64;
        let indices: Vec<f64> = (0..s.num_arms)
            .map(|i| moss_index(s.mean[i], s.pulls[i], horizon, s.num_arms))
            .collect();
        Ok(argmax(&indices))
    }

    fn train(&self, ps: &ParamState, _ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::MossAnytime(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let mut next = s.clone();
        next.pulls[arm] += 1;
        next.mean[arm] = incremental_mean(s.mean[arm], reward, next.pulls[arm]);
        next.round += 1;
        Ok(ParamState::MossAnytime(next))
    }
}
