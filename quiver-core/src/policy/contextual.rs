//! Contextual policies: LinUCB (ridge regression with confidence bounds) and
//! LinTS (Bayesian linear regression with posterior sampling).
//!
//! Both keep a per-arm design matrix `A` (identity-initialized) and a
//! reward-weighted context sum `b`. A singular design matrix falls back to a
//! regularized pseudo-inverse and finally to a zero-vector prediction, which
//! LinUCB treats as an infinite bound (argmax ties resolve to the lowest
//! index).

use ndarray::{Array1, Array2};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::linalg::{argmax, cholesky, column, invert, pseudo_invert};

use super::state::{LinearState, ParamState};
use super::{check_arm, parse_overrides, state_mismatch, Policy};

fn context_column(policy: &str, ctx: &Context, dim: usize) -> Result<Array1<f64>> {
    if ctx.vector.len() != dim {
        return Err(Error::InvalidArgument(format!(
            "{policy} expects a context vector of dimension {dim}, got {}",
            ctx.vector.len()
        )));
    }
    Ok(column(&ctx.vector))
}

fn outer(x: &Array1<f64>) -> Array2<f64> {
    let dim = x.len();
    Array2::from_shape_fn((dim, dim), |(i, j)| x[i] * x[j])
}

fn linear_train(s: &LinearState, arm: usize, x: &Array1<f64>, reward: f64) -> LinearState {
    let mut next = s.clone();
    next.design[arm] = &s.design[arm] + &outer(x);
    next.response[arm] = &s.response[arm] + &(reward * x);
    next
}

// ---------------------------------------------------------------------------
// LinUCB
// ---------------------------------------------------------------------------

pub struct LinUcb;

#[derive(Deserialize)]
struct LinUcbOverrides {
    dim: usize,
    #[serde(default = "default_lin_ucb_alpha")]
    alpha: f64,
}

fn default_lin_ucb_alpha() -> f64 {
    1.5
}

fn lin_ucb_bound(s: &LinearState, arm: usize, x: &Array1<f64>) -> f64 {
    let inv = match invert(&s.design[arm]).or_else(|| pseudo_invert(&s.design[arm])) {
        Some(inv) => inv,
        None => return f64::INFINITY,
    };
    let theta = inv.dot(&s.response[arm]);
    let mean = theta.dot(x);
    let spread = x.dot(&inv.dot(x));
    mean + s.scale * spread.max(0.0).sqrt()
}

impl Policy for LinUcb {
    fn name(&self) -> &'static str {
        "lin_ucb"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: LinUcbOverrides = parse_overrides(self.name(), overrides)?;
        if o.dim == 0 {
            return Err(Error::InvalidArgument("lin_ucb dim must be positive".into()));
        }
        if o.alpha <= 0.0 {
            return Err(Error::InvalidArgument(
                "lin_ucb alpha must be positive".into(),
            ));
        }
        Ok(ParamState::LinUcb(LinearState::identity(
            num_arms, o.dim, o.alpha,
        )))
    }

    fn select(&self, ps: &ParamState, ctx: &Context, _rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::LinUcb(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let x = context_column(self.name(), ctx, s.dim)?;
        let bounds: Vec<f64> = (0..s.num_arms).map(|i| lin_ucb_bound(s, i, &x)).collect();
        Ok(argmax(&bounds))
    }

    fn train(&self, ps: &ParamState, ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::LinUcb(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let x = context_column(self.name(), ctx, s.dim)?;
        Ok(ParamState::LinUcb(linear_train(s, arm, &x, reward)))
    }
}

// ---------------------------------------------------------------------------
// LinTS
// ---------------------------------------------------------------------------

pub struct LinTs;

#[derive(Deserialize)]
struct LinTsOverrides {
    dim: usize,
    #[serde(default = "default_lin_ts_v")]
    v: f64,
}

fn default_lin_ts_v() -> f64 {
    1.0
}

fn sample_theta(s: &LinearState, arm: usize, rng: &mut dyn RngCore) -> Array1<f64> {
    match invert(&s.design[arm]) {
        Some(inv) => {
            let mu = inv.dot(&s.response[arm]);
            // Symmetrize before factoring; v^2 scales the posterior.
            let cov = {
                let scaled = (s.scale * s.scale) * &inv;
                (&scaled + &scaled.t()) / 2.0
            };
            match cholesky(&cov) {
                Some(l) => {
                    let z: Array1<f64> = Array1::from_shape_fn(s.dim, |_| {
                        <StandardNormal as Distribution<f64>>::sample(&StandardNormal, &mut *rng)
                    });
                    &mu + &l.dot(&z)
                }
                None => mu,
            }
        }
        None => match pseudo_invert(&s.design[arm]) {
            Some(pinv) => pinv.dot(&s.response[arm]),
            None => Array1::zeros(s.dim),
        },
    }
}

impl Policy for LinTs {
    fn name(&self) -> &'static str {
        "lin_ts"
    }

    fn init_params(&self, num_arms: usize, overrides: &Map<String, Value>) -> Result<ParamState> {
        let o: LinTsOverrides = parse_overrides(self.name(), overrides)?;
        if o.dim == 0 {
            return Err(Error::InvalidArgument("lin_ts dim must be positive".into()));
        }
        if o.v <= 0.0 {
            return Err(Error::InvalidArgument("lin_ts v must be positive".into()));
        }
        Ok(ParamState::LinTs(LinearState::identity(
            num_arms, o.dim, o.v,
        )))
    }

    fn select(&self, ps: &ParamState, ctx: &Context, rng: &mut dyn RngCore) -> Result<usize> {
        let s = match ps {
            ParamState::LinTs(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        let x = context_column(self.name(), ctx, s.dim)?;
        let mut predictions = Vec::with_capacity(s.num_arms);
        for arm in 0..s.num_arms {
            let theta = sample_theta(s, arm, rng);
            predictions.push(theta.dot(&x));
        }
        Ok(argmax(&predictions))
    }

    fn train(&self, ps: &ParamState, ctx: &Context, arm: usize, reward: f64) -> Result<ParamState> {
        let s = match ps {
            ParamState::LinTs(s) => s,
            other => return Err(state_mismatch(self.name(), other)),
        };
        check_arm(ps, arm)?;
        let x = context_column(self.name(), ctx, s.dim)?;
        Ok(ParamState::LinTs(linear_train(s, arm, &x, reward)))
    }
}
