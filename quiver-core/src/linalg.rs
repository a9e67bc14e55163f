//! Small dense solvers for the contextual policies.
//!
//! Design matrices are `dim x dim` with dim in the tens at most, so a direct
//! Gauss-Jordan inverse is proportionate. The pseudo-inverse fallback is a
//! Tikhonov-regularized inverse with an escalating ridge; for the symmetric
//! positive semi-definite matrices these policies produce it converges to the
//! Moore-Penrose limit.

use ndarray::{Array1, Array2};

const PIVOT_EPS: f64 = 1e-12;

/// Gauss-Jordan inverse with partial pivoting. Returns `None` when a pivot
/// collapses (singular matrix).
pub fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return None;
    }
    // Augmented [A | I], reduced in place.
    let mut m = a.clone();
    let mut inv = Array2::<f64>::eye(n);

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| {
                m[[i, col]]
                    .abs()
                    .partial_cmp(&m[[j, col]].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if m[[pivot_row, col]].abs() < PIVOT_EPS {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap([col, k], [pivot_row, k]);
                inv.swap([col, k], [pivot_row, k]);
            }
        }
        let pivot = m[[col, col]];
        for k in 0..n {
            m[[col, k]] /= pivot;
            inv[[col, k]] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                m[[row, k]] -= factor * m[[col, k]];
                inv[[row, k]] -= factor * inv[[col, k]];
            }
        }
    }
    Some(inv)
}

/// Regularized inverse `(A + λI)^-1` with escalating λ. Returns `None` only
/// if every ridge level fails, which for finite inputs does not happen in
/// practice.
pub fn pseudo_invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return None;
    }
    let eye = Array2::<f64>::eye(n);
    let mut lambda = 1e-8;
    for _ in 0..8 {
        if let Some(inv) = invert(&(a + &(lambda * &eye))) {
            return Some(inv);
        }
        lambda *= 100.0;
    }
    None
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
/// Returns `None` when the matrix is not positive definite.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n != a.ncols() {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// First index of the maximum value. NaN entries are skipped; ties resolve
/// to the lowest index. An all-NaN (or empty) slice yields index 0.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0usize;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// Column vector from a slice.
pub fn column(x: &[f64]) -> Array1<f64> {
    Array1::from_vec(x.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn invert_identity() {
        let a = Array2::<f64>::eye(3);
        let inv = invert(&a).unwrap();
        assert_eq!(inv, Array2::<f64>::eye(3));
    }

    #[test]
    fn invert_roundtrip() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = invert(&a).unwrap();
        let prod = a.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((prod[[i, j]] - expect).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn invert_singular_returns_none() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(invert(&a).is_none());
        assert!(pseudo_invert(&a).is_some());
    }

    #[test]
    fn cholesky_of_spd() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky(&a).unwrap();
        let prod = l.dot(&l.t());
        for i in 0..2 {
            for j in 0..2 {
                assert!((prod[[i, j]] - a[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn argmax_prefers_lowest_index_on_tie() {
        assert_eq!(argmax(&[1.0, 1.0, 0.5]), 0);
        assert_eq!(argmax(&[f64::INFINITY, f64::INFINITY]), 0);
        assert_eq!(argmax(&[f64::NAN, 0.5, 0.5]), 1);
    }
}
