//! Stage equations posed by the step methods.
//!
//! One implicit stage solves for `z = z_pred + δ` with `z' = (δ + a)/γ`:
//! explicit problems give `G(δ) = δ + a - γ f(t, z)`, implicit ones
//! `G(δ) = γ F(t, z, z')`.

use crate::error::{IntegratorError, SimResult};
use crate::model::Model;
use nalgebra::{DMatrix, DVector};
use sf_core::{EvalError, EvalResult};
use sf_solver::{
    Increments, NonlinearBackend, NonlinearOutcome, NonlinearSolver, NonlinearSystem, SetupHint,
    SolveRequest, SolverError, banded_difference_jacobian, finite_difference_jacobian,
};

/// Borrowed integrator state a step method needs to solve its stages.
pub(crate) struct StageContext<'a, M: Model> {
    pub model: &'a mut M,
    pub solver: &'a mut NonlinearBackend,
    pub ewt: &'a DVector<f64>,
    pub bandwidth: Option<(usize, usize)>,
    pub step: u64,
    pub hint: SetupHint,
    /// Function evaluations spent on difference-quotient Jacobians.
    pub fd_evals: u64,
}

/// Coefficients of one stage.
pub(crate) struct StageInput<'s> {
    pub t: f64,
    pub h: f64,
    pub gamma: f64,
    pub zpred: &'s DVector<f64>,
    pub offset: &'s DVector<f64>,
    pub error_scale: f64,
}

impl<M: Model> StageContext<'_, M> {
    /// Solve one stage; `delta` holds the initial correction on entry.
    pub fn solve(
        &mut self,
        stage: &StageInput<'_>,
        delta: &mut DVector<f64>,
    ) -> SimResult<NonlinearOutcome> {
        let n = stage.zpred.len();
        let mut equation = StageEquation {
            model: &mut *self.model,
            t: stage.t,
            h: stage.h,
            gamma: stage.gamma,
            zpred: stage.zpred,
            offset: stage.offset,
            weights: self.ewt,
            bandwidth: self.bandwidth,
            z: DVector::zeros(n),
            zp: DVector::zeros(n),
            f: DVector::zeros(n),
            fd_evals: 0,
        };
        let request = SolveRequest {
            error_scale: stage.error_scale,
            step: self.step,
            hint: self.hint,
        };
        let result = self.solver.solve(&mut equation, delta, &request);
        self.fd_evals += equation.fd_evals;
        result.map_err(|e| solver_failure(stage.t, e))
    }

    /// `ydot = f(t, y)` through the model.
    pub fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        self.model.rhs(t, y, ydot)
    }
}

/// Map a fatal solver error to the integrator taxonomy.
pub(crate) fn solver_failure(t: f64, e: SolverError) -> IntegratorError {
    match e {
        SolverError::Eval(e) => evaluation_failure(t, e),
        other => IntegratorError::Solver(other),
    }
}

pub(crate) fn evaluation_failure(t: f64, e: EvalError) -> IntegratorError {
    match e {
        EvalError::Recoverable { what } | EvalError::Fatal { what } => {
            IntegratorError::Evaluation { t, what }
        }
    }
}

struct StageEquation<'s, M: Model> {
    model: &'s mut M,
    t: f64,
    h: f64,
    gamma: f64,
    zpred: &'s DVector<f64>,
    offset: &'s DVector<f64>,
    weights: &'s DVector<f64>,
    bandwidth: Option<(usize, usize)>,
    z: DVector<f64>,
    zp: DVector<f64>,
    f: DVector<f64>,
    fd_evals: u64,
}

impl<M: Model> StageEquation<'_, M> {
    /// `z = z_pred + δ` and, for implicit problems, `z' = (δ + a)/γ`.
    fn load(&mut self, delta: &DVector<f64>) {
        self.z.copy_from(self.zpred);
        self.z += delta;
        if self.model.is_implicit() {
            self.zp.copy_from(delta);
            self.zp += self.offset;
            self.zp /= self.gamma;
        }
    }
}

impl<M: Model> NonlinearSystem for StageEquation<'_, M> {
    fn size(&self) -> usize {
        self.zpred.len()
    }

    fn gamma(&self) -> f64 {
        self.gamma
    }

    fn weights(&self) -> &DVector<f64> {
        self.weights
    }

    fn residual(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
        self.load(delta);
        if self.model.is_implicit() {
            self.model.residual(self.t, &self.z, &self.zp, &mut self.f)?;
            out.copy_from(&self.f);
            *out *= self.gamma;
        } else {
            self.model.rhs(self.t, &self.z, &mut self.f)?;
            for i in 0..out.len() {
                out[i] = delta[i] + self.offset[i] - self.gamma * self.f[i];
            }
        }
        Ok(())
    }

    fn fixed_point(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
        if self.model.is_implicit() {
            return Err(EvalError::fatal(
                "fixed-point iteration requires an explicit problem",
            ));
        }
        self.load(delta);
        self.model.rhs(self.t, &self.z, &mut self.f)?;
        for i in 0..out.len() {
            out[i] = self.gamma * self.f[i] - self.offset[i];
        }
        Ok(())
    }

    fn jacobian(&mut self, delta: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
        self.load(delta);
        let implicit = self.model.is_implicit();
        if self.model.has_jacobian() {
            return self
                .model
                .jacobian(self.t, &self.z, &self.zp, 1.0 / self.gamma, jac);
        }

        let t = self.t;
        let gamma = self.gamma;
        let scale = Increments {
            ewt: self.weights,
            h: self.h,
        };
        let model = &mut *self.model;
        let (zpred, offset) = (self.zpred, self.offset);
        let mut yp = DVector::zeros(self.z.len());

        // g(z) = f(t, z), or F(t, z, (z - z_pred + a)/γ) for implicit problems
        let mut g = |y: &DVector<f64>, out: &mut DVector<f64>| -> EvalResult<()> {
            if implicit {
                for i in 0..y.len() {
                    yp[i] = (y[i] - zpred[i] + offset[i]) / gamma;
                }
                model.residual(t, y, &yp, out)
            } else {
                model.rhs(t, y, out)
            }
        };

        g(&self.z, &mut self.f)?;
        let evals = match self.bandwidth {
            Some(band) => banded_difference_jacobian(&self.z, &self.f, scale, band, &mut g, jac)?,
            None => finite_difference_jacobian(&self.z, &self.f, scale, &mut g, jac)?,
        };
        self.fd_evals += evals as u64 + 1;
        Ok(())
    }

    fn newton_matrix(&self, jac: &DMatrix<f64>, gamma: f64, out: &mut DMatrix<f64>) {
        out.copy_from(jac);
        if self.model.is_implicit() {
            *out *= gamma;
        } else {
            *out *= -gamma;
            for i in 0..out.nrows() {
                out[(i, i)] += 1.0;
            }
        }
    }

    fn jacobian_tracks_gamma(&self) -> bool {
        self.model.is_implicit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DaeSystem, Explicit, Implicit, OdeSystem};
    use sf_solver::{NewtonConfig, NonlinearSolverKind};

    struct Decay(f64);

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            2
        }

        fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
            ydot[0] = -self.0 * y[0];
            ydot[1] = -self.0 * y[1] + y[0];
            Ok(())
        }
    }

    /// The same system posed as `F = y' - f(y)`.
    struct DecayResidual(f64);

    impl DaeSystem for DecayResidual {
        fn dimension(&self) -> usize {
            2
        }

        fn residual(
            &mut self,
            _t: f64,
            y: &DVector<f64>,
            yp: &DVector<f64>,
            out: &mut DVector<f64>,
        ) -> EvalResult<()> {
            out[0] = yp[0] + self.0 * y[0];
            out[1] = yp[1] + self.0 * y[1] - y[0];
            Ok(())
        }
    }

    fn backward_euler<M: Model>(model: &mut M, h: f64) -> (DVector<f64>, u64) {
        let n = model.dimension();
        let mut solver =
            NonlinearBackend::from_kind(&NonlinearSolverKind::Newton(NewtonConfig::default()), n);
        let ewt = DVector::from_element(n, 1e6);
        let mut ctx = StageContext {
            model,
            solver: &mut solver,
            ewt: &ewt,
            bandwidth: None,
            step: 0,
            hint: SetupHint::None,
            fd_evals: 0,
        };
        let y0 = DVector::from_element(n, 1.0);
        // backward Euler: z = y0 + h f(z), so a = z_pred - y0 = 0
        let offset = DVector::zeros(n);
        let stage = StageInput {
            t: h,
            h,
            gamma: h,
            zpred: &y0,
            offset: &offset,
            error_scale: 1.0,
        };
        let mut delta = DVector::zeros(n);
        let outcome = ctx.solve(&stage, &mut delta).unwrap();
        assert!(outcome.is_converged());
        (&y0 + delta, ctx.fd_evals)
    }

    #[test]
    fn explicit_and_implicit_forms_agree() {
        let (z_ode, fd_ode) = backward_euler(&mut Explicit::new(Decay(3.0)), 0.1);
        let (z_dae, fd_dae) = backward_euler(&mut Implicit::new(DecayResidual(3.0)), 0.1);

        // (1 + 0.3) z0 = 1, (1 + 0.3) z1 = 1 + 0.1 z0
        let z0 = 1.0 / 1.3;
        let z1 = (1.0 + 0.1 * z0) / 1.3;
        assert!((z_ode[0] - z0).abs() < 1e-8);
        assert!((z_ode[1] - z1).abs() < 1e-8);
        assert!((&z_ode - &z_dae).amax() < 1e-8);
        assert_eq!(fd_ode, 3);
        assert_eq!(fd_dae, 3);
    }

    #[test]
    fn fatal_evaluation_maps_to_evaluation_error() {
        let e = solver_failure(0.5, SolverError::Eval(EvalError::fatal("nan")));
        assert_eq!(
            e,
            IntegratorError::Evaluation {
                t: 0.5,
                what: "nan".to_string()
            }
        );
    }
}
