//! Variable-order, quasi-constant step BDF (optionally NDF) on a
//! backward-difference array.
//!
//! `D[j]` holds the j-th backward difference of the solution polynomial at
//! spacing `h`. A step size change rescales `D`; the order is only
//! reconsidered once the method has taken `q + 1` steps at the same `h`.

use crate::controller::{OrderSelection, StepDecision};
use crate::error::{IntegratorError, SimResult};
use crate::method::Attempt;
use crate::model::Model;
use crate::options::{BdfConfig, MAX_BDF_ORDER};
use crate::stage::{StageContext, StageInput};
use nalgebra::{DMatrix, DVector};
use sf_core::{VectorOps, time_roundoff};
use sf_solver::NonlinearOutcome;

const N: usize = MAX_BDF_ORDER + 2;

/// NDF modifiers; zero gives plain BDF.
const KAPPA: [f64; N] = [0.0, -0.185, -1.0 / 9.0, -0.0823, -0.0415, 0.0, 0.0];

#[derive(Clone, Debug, PartialEq)]
struct Coefficients {
    gamma: [f64; N],
    alpha: [f64; N],
    error_const: [f64; N],
}

impl Coefficients {
    fn new(ndf: bool) -> Self {
        let mut gamma = [0.0; N];
        let mut alpha = [0.0; N];
        let mut error_const = [0.0; N];
        for i in 1..N {
            gamma[i] = gamma[i - 1] + 1.0 / i as f64;
        }
        for i in 0..N {
            let kappa = if ndf { KAPPA[i] } else { 0.0 };
            alpha[i] = (1.0 - kappa) * gamma[i];
            error_const[i] = kappa * gamma[i] + 1.0 / (i as f64 + 1.0);
        }
        Self {
            gamma,
            alpha,
            error_const,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Bdf {
    max_order: usize,
    ndf: bool,
    coeffs: Coefficients,
    order: usize,
    t: f64,
    /// Spacing `D` is expressed in.
    h: f64,
    /// Size of the last accepted step.
    h_used: f64,
    steps_at_h: usize,
    d: Vec<DVector<f64>>,
    ypred: DVector<f64>,
    psi: DVector<f64>,
    delta: DVector<f64>,
    y_new: DVector<f64>,
    error: DVector<f64>,
    work: DVector<f64>,
}

impl Bdf {
    pub fn new(config: &BdfConfig, dimension: usize) -> Self {
        let zeros = DVector::zeros(dimension);
        Self {
            max_order: config.max_order.clamp(1, MAX_BDF_ORDER),
            ndf: config.ndf,
            coeffs: Coefficients::new(config.ndf),
            order: 1,
            t: 0.0,
            h: 0.0,
            h_used: 0.0,
            steps_at_h: 0,
            d: vec![zeros.clone(); MAX_BDF_ORDER + 3],
            ypred: zeros.clone(),
            psi: zeros.clone(),
            delta: zeros.clone(),
            y_new: zeros.clone(),
            error: zeros.clone(),
            work: zeros,
        }
    }

    pub fn name(&self) -> &'static str {
        if self.ndf { "ndf" } else { "bdf" }
    }

    pub fn initialize(&mut self, t0: f64, y0: &DVector<f64>, dy0: &DVector<f64>, h: f64) {
        for dj in self.d.iter_mut() {
            dj.fill(0.0);
        }
        self.d[0].copy_from(y0);
        self.d[1].scale_from(h, dy0);
        self.y_new.copy_from(y0);
        self.error.fill(0.0);
        self.order = 1;
        self.t = t0;
        self.h = h;
        self.h_used = 0.0;
        self.steps_at_h = 0;
    }

    pub(crate) fn attempt<M: Model>(
        &mut self,
        ctx: &mut StageContext<'_, M>,
        h: f64,
    ) -> SimResult<Attempt> {
        if !(h > 0.0 && h.is_finite()) {
            return Err(IntegratorError::invalid(format!(
                "step size {h} must be positive and finite"
            )));
        }
        if h != self.h {
            self.rescale(h / self.h);
            self.h = h;
            self.steps_at_h = 0;
        }

        let q = self.order;
        let c = &self.coeffs;
        self.ypred.copy_from(&self.d[0]);
        self.psi.fill(0.0);
        for j in 1..=q {
            self.ypred += &self.d[j];
            self.psi.axpy(c.gamma[j] / c.alpha[q], &self.d[j], 1.0);
        }

        self.delta.fill(0.0);
        let stage = StageInput {
            t: self.t + h,
            h,
            gamma: h / c.alpha[q],
            zpred: &self.ypred,
            offset: &self.psi,
            error_scale: c.error_const[q],
        };
        if let NonlinearOutcome::Failed(failure) = ctx.solve(&stage, &mut self.delta)? {
            return Ok(Attempt::Failed(failure));
        }

        self.y_new.copy_from(&self.ypred);
        self.y_new += &self.delta;
        self.error.scale_from(c.error_const[q], &self.delta);

        let orders = if self.steps_at_h + 1 > q {
            // candidate errors are taken from the updated differences
            let lower = if q > 1 {
                self.work.copy_from(&self.d[q]);
                self.work += &self.delta;
                self.work *= c.error_const[q - 1];
                Some(self.work.wrms_norm(ctx.ewt))
            } else {
                None
            };
            let upper = if q < self.max_order {
                let ec = c.error_const[q + 1];
                self.work.linear_sum(ec, &self.delta, -ec, &self.d[q + 1]);
                Some(self.work.wrms_norm(ctx.ewt))
            } else {
                None
            };
            OrderSelection::Candidates { lower, upper }
        } else {
            OrderSelection::Hold
        };
        Ok(Attempt::Solved { orders })
    }

    pub fn accept(&mut self, decision: &StepDecision) {
        let q = self.order;
        {
            let (lo, hi) = self.d.split_at_mut(q + 2);
            hi[0].linear_sum(1.0, &self.delta, -1.0, &lo[q + 1]);
            lo[q + 1].copy_from(&self.delta);
        }
        for i in (0..=q).rev() {
            let (lo, hi) = self.d.split_at_mut(i + 1);
            lo[i] += &hi[0];
        }

        self.t += self.h;
        self.h_used = self.h;
        self.steps_at_h += 1;
        if decision.order_next != q {
            self.order = decision.order_next.clamp(1, self.max_order);
            self.steps_at_h = 0;
        }
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub(crate) fn snap_time(&mut self, t: f64) {
        self.t = t;
    }

    pub fn current(&self) -> &DVector<f64> {
        &self.d[0]
    }

    pub fn solution(&self) -> &DVector<f64> {
        &self.y_new
    }

    pub fn local_error(&self) -> &DVector<f64> {
        &self.error
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Evaluate the difference polynomial on `[t - h_used, t]`.
    pub fn interpolate(&self, t: f64, out: &mut DVector<f64>) -> SimResult<()> {
        let tol = time_roundoff(self.t, self.h_used);
        if t < self.t - self.h_used - tol || t > self.t + tol {
            return Err(IntegratorError::invalid(format!(
                "t = {t} is outside the last step [{}, {}]",
                self.t - self.h_used,
                self.t
            )));
        }

        out.copy_from(&self.d[0]);
        let mut p = 1.0;
        for j in 0..self.order {
            let shift = self.t - self.h * j as f64;
            p *= (t - shift) / (self.h * (j as f64 + 1.0));
            out.axpy(p, &self.d[j + 1], 1.0);
        }
        Ok(())
    }

    /// Re-express `D[0..=q]` at spacing `factor * h`.
    fn rescale(&mut self, factor: f64) {
        let q = self.order;
        let ru = difference_transform(q, factor) * difference_transform(q, 1.0);
        let old: Vec<DVector<f64>> = self.d[..=q].to_vec();
        for (i, di) in self.d[..=q].iter_mut().enumerate() {
            di.fill(0.0);
            for (k, dk) in old.iter().enumerate() {
                di.axpy(ru[(k, i)], dk, 1.0);
            }
        }
    }
}

/// Transform between difference arrays at spacings `h` and `factor * h`.
fn difference_transform(q: usize, factor: f64) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(q + 1, q + 1);
    for i in 1..=q {
        for j in 1..=q {
            m[(i, j)] = (i as f64 - 1.0 - factor * j as f64) / i as f64;
        }
    }
    m.row_mut(0).fill(1.0);
    for i in 1..=q {
        for j in 0..=q {
            m[(i, j)] *= m[(i - 1, j)];
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Explicit, OdeSystem};
    use sf_core::EvalResult;
    use sf_solver::{NewtonConfig, NonlinearBackend, NonlinearSolverKind, SetupHint};

    struct Decay;

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
            ydot[0] = -2.0 * y[0];
            Ok(())
        }
    }

    fn quadratic_history(h: f64) -> Bdf {
        // y = t^2 at t = 1
        let mut bdf = Bdf::new(&BdfConfig::default(), 1);
        bdf.t = 1.0;
        bdf.h = h;
        bdf.h_used = h;
        bdf.order = 2;
        bdf.d[0][0] = 1.0;
        bdf.d[1][0] = 1.0 - (1.0 - h) * (1.0 - h);
        bdf.d[2][0] = 2.0 * h * h;
        bdf
    }

    #[test]
    fn plain_bdf_coefficients() {
        let c = Coefficients::new(false);
        assert_eq!(c.alpha, c.gamma);
        assert!((c.gamma[3] - 11.0 / 6.0).abs() < 1e-15);
        assert!((c.error_const[2] - 1.0 / 3.0).abs() < 1e-15);
    }

    #[test]
    fn ndf_shifts_error_constants() {
        let c = Coefficients::new(true);
        assert!((c.error_const[1] - (0.5 - 0.185)).abs() < 1e-15);
        assert_eq!(c.alpha[5], c.gamma[5]);
    }

    #[test]
    fn rescale_halves_spacing() {
        let mut bdf = quadratic_history(0.1);
        bdf.rescale(0.5);
        assert!((bdf.d[0][0] - 1.0).abs() < 1e-14);
        assert!((bdf.d[1][0] - 0.0975).abs() < 1e-14);
        assert!((bdf.d[2][0] - 0.005).abs() < 1e-14);
    }

    #[test]
    fn interpolation_reproduces_polynomial() {
        let bdf = quadratic_history(0.1);
        let mut out = DVector::zeros(1);
        for t in [0.9, 0.95, 1.0] {
            bdf.interpolate(t, &mut out).unwrap();
            assert!((out[0] - t * t).abs() < 1e-14);
        }
        assert!(bdf.interpolate(0.8, &mut out).is_err());
    }

    #[test]
    fn first_step_is_backward_euler() {
        let mut model = Explicit::new(Decay);
        let mut solver =
            NonlinearBackend::from_kind(&NonlinearSolverKind::Newton(NewtonConfig::default()), 1);
        let ewt = DVector::from_element(1, 1e4);
        let mut ctx = StageContext {
            model: &mut model,
            solver: &mut solver,
            ewt: &ewt,
            bandwidth: None,
            step: 0,
            hint: SetupHint::None,
            fd_evals: 0,
        };

        let mut bdf = Bdf::new(&BdfConfig::default(), 1);
        let y0 = DVector::from_element(1, 1.0);
        let f0 = DVector::from_element(1, -2.0);
        bdf.initialize(0.0, &y0, &f0, 0.1);
        let attempt = bdf.attempt(&mut ctx, 0.1).unwrap();
        assert_eq!(
            attempt,
            Attempt::Solved {
                orders: OrderSelection::Hold
            }
        );
        assert!((bdf.solution()[0] - 1.0 / 1.2).abs() < 1e-9);
        // error constant 1/2 times the distance from the Euler predictor 0.8
        assert!((bdf.local_error()[0] - 0.5 * (1.0 / 1.2 - 0.8)).abs() < 1e-9);

        let decision = StepDecision {
            accept: true,
            h_next: 0.1,
            order_next: 1,
            eta: 1.0,
        };
        bdf.accept(&decision);
        assert!((bdf.t() - 0.1).abs() < 1e-15);
        assert!((bdf.current()[0] - 1.0 / 1.2).abs() < 1e-9);

        // two steps at the same h unlock order selection
        let attempt = bdf.attempt(&mut ctx, 0.1).unwrap();
        assert!(matches!(
            attempt,
            Attempt::Solved {
                orders: OrderSelection::Candidates {
                    lower: None,
                    upper: Some(_)
                }
            }
        ));
    }
}
