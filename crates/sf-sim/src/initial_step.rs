//! First step size estimation.

use crate::error::{IntegratorError, SimResult};
use crate::model::Model;
use crate::stage::evaluation_failure;
use nalgebra::DVector;
use sf_core::{UNIT_ROUNDOFF, VectorOps};

const LOWER_BOUND_FACTOR: f64 = 100.0;
const UPPER_BOUND_FACTOR: f64 = 0.1;
const BIAS: f64 = 0.5;
const MAX_PASSES: usize = 4;
/// Probe shrink after a recoverable evaluation failure.
const PROBE_SHRINK: f64 = 0.2;

fn distance(t0: f64, tout: f64) -> SimResult<f64> {
    let tdist = tout - t0;
    if tdist <= 2.0 * UNIT_ROUNDOFF * t0.abs().max(tout.abs()) {
        return Err(IntegratorError::invalid(format!(
            "tout = {tout} too close to t0 = {t0} to start integration"
        )));
    }
    Ok(tdist)
}

/// Estimate `h0` for `y' = f(t, y)` from a difference quotient of `f`.
pub(crate) fn estimate_explicit<M: Model>(
    model: &mut M,
    t0: f64,
    y0: &DVector<f64>,
    f0: &DVector<f64>,
    ewt: &DVector<f64>,
    tout: f64,
) -> SimResult<f64> {
    let tdist = distance(t0, tout)?;
    let hlb = LOWER_BOUND_FACTOR * UNIT_ROUNDOFF * t0.abs().max(tout.abs());

    // 1/hub bounds the relative change of any component over one step
    let mut hub_inv: f64 = 0.0;
    for i in 0..y0.len() {
        let scale = UPPER_BOUND_FACTOR * y0[i].abs() + 1.0 / ewt[i];
        hub_inv = hub_inv.max(f0[i].abs() / scale);
    }
    let mut hub = UPPER_BOUND_FACTOR * tdist;
    if hub * hub_inv > 1.0 {
        hub = 1.0 / hub_inv;
    }

    let mut hg = (hlb * hub).sqrt();
    if hub < hlb {
        return Ok(hg);
    }

    let mut y1 = DVector::zeros(y0.len());
    let mut f1 = DVector::zeros(y0.len());
    let mut hnew = hg;
    let mut pass = 0;
    while pass < MAX_PASSES {
        y1.linear_sum(1.0, y0, hg, f0);
        if let Err(e) = model.rhs(t0 + hg, &y1, &mut f1) {
            if !e.is_recoverable() {
                return Err(evaluation_failure(t0 + hg, e));
            }
            hg *= PROBE_SHRINK;
            if hg < hlb {
                return Err(IntegratorError::Evaluation {
                    t: t0,
                    what: "right-hand side failed at every initial step probe".to_string(),
                });
            }
            continue;
        }
        pass += 1;

        f1 -= f0;
        f1 /= hg;
        let yddnrm = f1.wrms_norm(ewt);
        hnew = if yddnrm * hub * hub > 2.0 {
            (2.0 / yddnrm).sqrt()
        } else {
            (hg * hub).sqrt()
        };
        if pass >= MAX_PASSES {
            break;
        }

        let ratio = hnew / hg;
        if ratio > 0.5 && ratio < 2.0 {
            break;
        }
        if pass >= 2 && ratio > 2.0 {
            hnew = hg;
            break;
        }
        hg = hnew;
    }

    Ok((BIAS * hnew).clamp(hlb, hub))
}

/// Estimate `h0` for `F(t, y, y') = 0` from the initial derivative.
pub(crate) fn estimate_implicit(
    t0: f64,
    yp0: &DVector<f64>,
    ewt: &DVector<f64>,
    tout: f64,
) -> SimResult<f64> {
    let tdist = distance(t0, tout)?;
    let mut h = 0.001 * tdist;
    let ypnorm = yp0.wrms_norm(ewt);
    if ypnorm > 0.5 / h {
        h = 0.5 / ypnorm;
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Explicit, OdeSystem};
    use sf_core::{EvalError, EvalResult};

    struct Decay {
        rate: f64,
        fail_beyond: Option<f64>,
    }

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
            if self.fail_beyond.is_some_and(|tf| t > tf) {
                return Err(EvalError::recoverable("probe too far"));
            }
            ydot[0] = -self.rate * y[0];
            Ok(())
        }
    }

    fn estimate(fail_beyond: Option<f64>) -> SimResult<f64> {
        let mut model = Explicit::new(Decay {
            rate: 100.0,
            fail_beyond,
        });
        let y0 = DVector::from_element(1, 1.0);
        let f0 = DVector::from_element(1, -100.0);
        let ewt = DVector::from_element(1, 1.0 / (1e-6 + 1e-10));
        estimate_explicit(&mut model, 0.0, &y0, &f0, &ewt, 1.0)
    }

    #[test]
    fn stiff_decay_gets_a_small_first_step() {
        // 0.5 * sqrt(2 / |y''|_wrms) with |y''| = 1e4
        let h = estimate(None).unwrap();
        let expected = 0.5 * (2.0_f64 / (1e4 / (1e-6 + 1e-10))).sqrt();
        assert!((h - expected).abs() < 1e-3 * expected, "h = {h}");
    }

    #[test]
    fn recoverable_probe_failures_shrink_the_probe() {
        let h = estimate(Some(1e-6)).unwrap();
        assert!(h > 0.0 && h < 1e-4);
        assert!(estimate(Some(-1.0)).is_err());
    }

    #[test]
    fn tout_at_t0_is_rejected() {
        let ewt = DVector::from_element(1, 1.0);
        let yp0 = DVector::from_element(1, 1.0);
        assert!(estimate_implicit(1.0, &yp0, &ewt, 1.0).is_err());
    }

    #[test]
    fn implicit_estimate_limits_first_change() {
        let ewt = DVector::from_element(1, 1e4);
        let yp0 = DVector::from_element(1, 2.0);
        // 0.001 * 10 = 0.01 would change y by 0.02, i.e. 200 weighted units
        let h = estimate_implicit(0.0, &yp0, &ewt, 10.0).unwrap();
        assert!((h - 0.5 / 2e4).abs() < 1e-15);
    }
}
