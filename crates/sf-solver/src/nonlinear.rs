//! Stage-equation abstraction and the nonlinear solver contract.
//!
//! A step method poses `G(δ) = 0` on the correction `δ = z - z_pred`.
//! Explicit problems use `G(δ) = δ + a - γ f(t, z_pred + δ)`; implicit
//! problems use `G(δ) = γ F(t, z_pred + δ, (δ + a)/γ)`.

use crate::convergence::{ConvergenceConfig, ConvergenceInfo};
use crate::error::SolverResult;
use crate::fixed_point::{FixedPointConfig, FixedPointSolver};
use crate::newton::{NewtonConfig, NewtonSolver};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sf_core::EvalResult;

/// One stage equation as seen by a nonlinear solver.
pub trait NonlinearSystem {
    fn size(&self) -> usize;

    /// Method coefficient scaling the stage derivative.
    fn gamma(&self) -> f64;

    /// Weights for the correction norm.
    fn weights(&self) -> &DVector<f64>;

    /// `out = G(δ)`.
    fn residual(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()>;

    /// `out = Φ(δ)`, the fixed-point form of `G(δ) = 0`.
    fn fixed_point(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()>;

    /// Jacobian of the underlying problem at `z_pred + δ`.
    ///
    /// Explicit problems fill `∂f/∂y`; implicit ones `∂F/∂y + ∂F/∂y'/γ`.
    fn jacobian(&mut self, delta: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()>;

    /// Build the iteration matrix from a Jacobian and `gamma`.
    fn newton_matrix(&self, jac: &DMatrix<f64>, gamma: f64, out: &mut DMatrix<f64>) {
        out.copy_from(jac);
        *out *= -gamma;
        for i in 0..out.nrows() {
            out[(i, i)] += 1.0;
        }
    }

    /// True when `jacobian` itself depends on `gamma`.
    fn jacobian_tracks_gamma(&self) -> bool {
        false
    }
}

/// Why the caller is solving again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetupHint {
    #[default]
    None,
    AfterConvergenceFailure,
    AfterErrorFailure,
}

/// Per-solve inputs from the step method.
#[derive(Clone, Copy, Debug)]
pub struct SolveRequest {
    /// Error constant of the method relative to the correction.
    pub error_scale: f64,
    /// Index of the step being attempted.
    pub step: u64,
    pub hint: SetupHint,
}

/// Retriable failures; fatal ones come back as `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonlinearFailure {
    Diverged,
    TooManyIterations,
    Recoverable,
    SingularMatrix,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonlinearOutcome {
    Converged { iterations: usize },
    Failed(NonlinearFailure),
}

impl NonlinearOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, NonlinearOutcome::Converged { .. })
    }
}

/// Cumulative counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NonlinearStats {
    pub iterations: u64,
    pub convergence_failures: u64,
    pub jacobian_evals: u64,
    pub linear_setups: u64,
}

pub trait NonlinearSolver {
    /// Solve for `delta` starting from its current contents.
    fn solve<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &mut DVector<f64>,
        request: &SolveRequest,
    ) -> SolverResult<NonlinearOutcome>;

    /// Forget any cached matrices and rate estimates.
    fn invalidate(&mut self);

    fn convergence_info(&self) -> ConvergenceInfo;

    fn stats(&self) -> &NonlinearStats;

    fn name(&self) -> &'static str;
}

/// Strategy selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NonlinearSolverKind {
    Newton(NewtonConfig),
    FixedPoint(FixedPointConfig),
}

impl Default for NonlinearSolverKind {
    fn default() -> Self {
        NonlinearSolverKind::Newton(NewtonConfig::default())
    }
}

impl NonlinearSolverKind {
    pub fn convergence(&self) -> &ConvergenceConfig {
        match self {
            NonlinearSolverKind::Newton(c) => &c.convergence,
            NonlinearSolverKind::FixedPoint(c) => &c.convergence,
        }
    }

    pub fn needs_jacobian(&self) -> bool {
        matches!(self, NonlinearSolverKind::Newton(_))
    }
}

/// Solver built from a [`NonlinearSolverKind`].
#[derive(Clone, Debug)]
pub enum NonlinearBackend {
    Newton(NewtonSolver),
    FixedPoint(FixedPointSolver),
}

impl NonlinearBackend {
    pub fn from_kind(kind: &NonlinearSolverKind, size: usize) -> Self {
        match kind {
            NonlinearSolverKind::Newton(config) => {
                NonlinearBackend::Newton(NewtonSolver::new(config.clone(), size))
            }
            NonlinearSolverKind::FixedPoint(config) => {
                NonlinearBackend::FixedPoint(FixedPointSolver::new(config.clone(), size))
            }
        }
    }
}

impl NonlinearSolver for NonlinearBackend {
    fn solve<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &mut DVector<f64>,
        request: &SolveRequest,
    ) -> SolverResult<NonlinearOutcome> {
        match self {
            NonlinearBackend::Newton(s) => s.solve(system, delta, request),
            NonlinearBackend::FixedPoint(s) => s.solve(system, delta, request),
        }
    }

    fn invalidate(&mut self) {
        match self {
            NonlinearBackend::Newton(s) => s.invalidate(),
            NonlinearBackend::FixedPoint(s) => s.invalidate(),
        }
    }

    fn convergence_info(&self) -> ConvergenceInfo {
        match self {
            NonlinearBackend::Newton(s) => s.convergence_info(),
            NonlinearBackend::FixedPoint(s) => s.convergence_info(),
        }
    }

    fn stats(&self) -> &NonlinearStats {
        match self {
            NonlinearBackend::Newton(s) => s.stats(),
            NonlinearBackend::FixedPoint(s) => s.stats(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            NonlinearBackend::Newton(s) => s.name(),
            NonlinearBackend::FixedPoint(s) => s.name(),
        }
    }
}
