//! Finite difference Jacobian computation.
//!
//! Increments follow the usual weighted rule
//! `inc_j = max(sqrt(u)*|y_j|, min_inc/ewt_j)` with
//! `min_inc = 1000*|h|*u*N*‖f‖_wrms` (or 1 when `f` vanishes), so that
//! perturbations are meaningful relative to the requested tolerances.

use nalgebra::{DMatrix, DVector};
use sf_core::{EvalResult, UNIT_ROUNDOFF, VectorOps};

const MIN_INC_MULT: f64 = 1000.0;

/// Scale information for choosing increments.
#[derive(Clone, Copy, Debug)]
pub struct Increments<'a> {
    /// Error weights at the current iterate.
    pub ewt: &'a DVector<f64>,
    /// Current step size.
    pub h: f64,
}

impl Increments<'_> {
    fn min_increment(&self, fy: &DVector<f64>) -> f64 {
        let fnorm = fy.wrms_norm(self.ewt);
        if fnorm != 0.0 {
            MIN_INC_MULT * self.h.abs() * UNIT_ROUNDOFF * fy.len() as f64 * fnorm
        } else {
            1.0
        }
    }

    fn increment(&self, yj: f64, wj: f64, min_inc: f64) -> f64 {
        (UNIT_ROUNDOFF.sqrt() * yj.abs()).max(min_inc / wj)
    }
}

/// Fill `jac` with forward differences of `f` at `y`, where `fy = f(y)`.
///
/// Returns the number of evaluations of `f`.
pub fn finite_difference_jacobian<F>(
    y: &DVector<f64>,
    fy: &DVector<f64>,
    scale: Increments<'_>,
    mut f: F,
    jac: &mut DMatrix<f64>,
) -> EvalResult<usize>
where
    F: FnMut(&DVector<f64>, &mut DVector<f64>) -> EvalResult<()>,
{
    let n = y.len();
    let min_inc = scale.min_increment(fy);
    let mut y_perturbed = y.clone();
    let mut f_perturbed = DVector::zeros(fy.len());

    for j in 0..n {
        let inc = scale.increment(y[j], scale.ewt[j], min_inc);
        y_perturbed[j] = y[j] + inc;
        let status = f(&y_perturbed, &mut f_perturbed);
        y_perturbed[j] = y[j];
        status?;

        let inv = 1.0 / inc;
        for i in 0..fy.len() {
            jac[(i, j)] = (f_perturbed[i] - fy[i]) * inv;
        }
    }

    Ok(n)
}

/// Banded variant: columns `upper + lower + 1` apart share one evaluation.
///
/// Entries outside the band are set to zero. Returns the number of
/// evaluations of `f`.
pub fn banded_difference_jacobian<F>(
    y: &DVector<f64>,
    fy: &DVector<f64>,
    scale: Increments<'_>,
    (upper, lower): (usize, usize),
    mut f: F,
    jac: &mut DMatrix<f64>,
) -> EvalResult<usize>
where
    F: FnMut(&DVector<f64>, &mut DVector<f64>) -> EvalResult<()>,
{
    let n = y.len();
    let width = (upper + lower + 1).min(n.max(1));
    let min_inc = scale.min_increment(fy);
    let mut y_perturbed = y.clone();
    let mut f_perturbed = DVector::zeros(n);
    let increments: Vec<f64> = (0..n)
        .map(|j| scale.increment(y[j], scale.ewt[j], min_inc))
        .collect();

    jac.fill(0.0);
    for group in 0..width {
        for j in (group..n).step_by(width) {
            y_perturbed[j] = y[j] + increments[j];
        }
        let status = f(&y_perturbed, &mut f_perturbed);
        for j in (group..n).step_by(width) {
            y_perturbed[j] = y[j];
        }
        status?;

        for j in (group..n).step_by(width) {
            let inv = 1.0 / increments[j];
            let first = j.saturating_sub(upper);
            let last = (j + lower).min(n - 1);
            for i in first..=last {
                jac[(i, j)] = (f_perturbed[i] - fy[i]) * inv;
            }
        }
    }

    Ok(width)
}
