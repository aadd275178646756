//! Integration tests: the same stage equation through every solver backend.

use nalgebra::{DMatrix, DVector};
use sf_core::{EvalResult, VectorOps};
use sf_solver::{
    FixedPointConfig, Increments, LinearSolverKind, NewtonConfig, NonlinearBackend,
    NonlinearSolver, NonlinearSolverKind, NonlinearSystem, SetupHint, SolveRequest,
    banded_difference_jacobian, finite_difference_jacobian,
};

/// Backward Euler stage for a discretized reaction-diffusion line
/// `y_i' = d (y_{i-1} - 2 y_i + y_{i+1}) - y_i^3`.
struct ReactionDiffusion {
    diffusion: f64,
    y_pred: DVector<f64>,
    gamma: f64,
    weights: DVector<f64>,
    banded: bool,
    rhs_evals: usize,
}

impl ReactionDiffusion {
    fn new(n: usize, gamma: f64, banded: bool) -> Self {
        Self {
            diffusion: 4.0,
            y_pred: DVector::from_fn(n, |i, _| 1.0 + 0.05 * i as f64),
            gamma,
            weights: DVector::from_element(n, 1e4),
            banded,
            rhs_evals: 0,
        }
    }

    fn rhs(diffusion: f64, y: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
        let n = y.len();
        for i in 0..n {
            let left = if i > 0 { y[i - 1] } else { 0.0 };
            let right = if i + 1 < n { y[i + 1] } else { 0.0 };
            out[i] = diffusion * (left - 2.0 * y[i] + right) - y[i].powi(3);
        }
        Ok(())
    }
}

impl NonlinearSystem for ReactionDiffusion {
    fn size(&self) -> usize {
        self.y_pred.len()
    }

    fn gamma(&self) -> f64 {
        self.gamma
    }

    fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    fn residual(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
        let z = &self.y_pred + delta;
        let mut f = DVector::zeros(z.len());
        Self::rhs(self.diffusion, &z, &mut f)?;
        self.rhs_evals += 1;
        out.linear_sum(1.0, delta, -self.gamma, &f);
        Ok(())
    }

    fn fixed_point(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
        let z = &self.y_pred + delta;
        let mut f = DVector::zeros(z.len());
        Self::rhs(self.diffusion, &z, &mut f)?;
        self.rhs_evals += 1;
        out.scale_from(self.gamma, &f);
        Ok(())
    }

    fn jacobian(&mut self, delta: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
        let z = &self.y_pred + delta;
        let mut fz = DVector::zeros(z.len());
        Self::rhs(self.diffusion, &z, &mut fz)?;
        let scale = Increments {
            ewt: &self.weights,
            h: self.gamma,
        };
        let d = self.diffusion;
        let evals = if self.banded {
            banded_difference_jacobian(&z, &fz, scale, (1, 1), |y, out| Self::rhs(d, y, out), jac)?
        } else {
            finite_difference_jacobian(&z, &fz, scale, |y, out| Self::rhs(d, y, out), jac)?
        };
        self.rhs_evals += evals + 1;
        Ok(())
    }
}

fn request() -> SolveRequest {
    SolveRequest {
        error_scale: 1.0,
        step: 0,
        hint: SetupHint::None,
    }
}

fn solve_with(kind: &NonlinearSolverKind, system: &mut ReactionDiffusion) -> DVector<f64> {
    let n = system.size();
    let mut solver = NonlinearBackend::from_kind(kind, n);
    let mut delta = DVector::zeros(n);
    let outcome = solver.solve(system, &mut delta, &request()).unwrap();
    assert!(outcome.is_converged(), "{} did not converge", solver.name());
    delta
}

#[test]
fn dense_and_banded_newton_agree() {
    let n = 12;
    let config = NewtonConfig {
        max_iterations: 5,
        ..NewtonConfig::default()
    };
    let dense_kind = NonlinearSolverKind::Newton(config.clone());
    let banded_kind = NonlinearSolverKind::Newton(NewtonConfig {
        linear: LinearSolverKind::Banded { upper: 1, lower: 1 },
        ..config
    });

    let mut dense_system = ReactionDiffusion::new(n, 0.01, false);
    let mut banded_system = ReactionDiffusion::new(n, 0.01, true);
    let dense = solve_with(&dense_kind, &mut dense_system);
    let banded = solve_with(&banded_kind, &mut banded_system);

    let mut diff = &dense - &banded;
    diff.component_mul_assign(&dense_system.weights);
    assert!(diff.amax() < 0.1);
    assert!(banded_system.rhs_evals < dense_system.rhs_evals);
}

#[test]
fn newton_and_fixed_point_agree_on_mild_stage() {
    let n = 6;
    let newton_kind = NonlinearSolverKind::Newton(NewtonConfig::default());
    let fixed_kind = NonlinearSolverKind::FixedPoint(FixedPointConfig {
        anderson_depth: 2,
        ..FixedPointConfig::default()
    });

    let mut a = ReactionDiffusion::new(n, 0.01, false);
    let mut b = ReactionDiffusion::new(n, 0.01, false);
    let newton = solve_with(&newton_kind, &mut a);
    let fixed = solve_with(&fixed_kind, &mut b);

    let mut diff = &newton - &fixed;
    diff.component_mul_assign(&a.weights);
    assert!(diff.amax() < 1.0);
}
