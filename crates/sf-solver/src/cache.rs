//! Jacobian and factored iteration matrix kept across stage solves.

use crate::error::SolverResult;
use crate::linear::{LinearBackend, LinearSolver, LinearSolverKind};
use crate::nonlinear::{NonlinearSystem, SetupHint};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// When to refactor the iteration matrix and when to re-evaluate `J`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JacobianReuse {
    /// Relative change in gamma that forces a refactorization.
    pub dgmax: f64,
    /// Maximum steps between refactorizations.
    pub msbp: u64,
    /// Maximum steps between Jacobian evaluations.
    pub msbj: u64,
    /// Measured rate above which `J` is re-evaluated.
    pub rate_threshold: f64,
}

impl Default for JacobianReuse {
    fn default() -> Self {
        Self {
            dgmax: 0.2,
            msbp: 20,
            msbj: 50,
            rate_threshold: 0.9,
        }
    }
}

/// What a setup must do before iterating.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPlan {
    pub refactor: bool,
    pub reevaluate: bool,
}

impl SetupPlan {
    pub fn full() -> Self {
        Self {
            refactor: true,
            reevaluate: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JacobianCache {
    jacobian: DMatrix<f64>,
    matrix: DMatrix<f64>,
    linear: LinearBackend,
    has_jacobian: bool,
    factored: bool,
    gamma_factored: f64,
    step_jacobian: u64,
    step_setup: u64,
    rate: f64,
    measured_rate: f64,
}

impl JacobianCache {
    pub fn new(kind: LinearSolverKind, size: usize) -> Self {
        Self {
            jacobian: DMatrix::zeros(size, size),
            matrix: DMatrix::zeros(size, size),
            linear: LinearBackend::from_kind(kind),
            has_jacobian: false,
            factored: false,
            gamma_factored: 0.0,
            step_jacobian: 0,
            step_setup: 0,
            rate: 1.0,
            measured_rate: 0.0,
        }
    }

    /// Drop the Jacobian, the factorization and the rate estimate.
    pub fn invalidate(&mut self) {
        self.has_jacobian = false;
        self.factored = false;
        self.rate = 1.0;
        self.measured_rate = 0.0;
    }

    pub fn is_factored(&self) -> bool {
        self.factored
    }

    pub fn gamma_factored(&self) -> f64 {
        self.gamma_factored
    }

    pub fn jacobian(&self) -> Option<&DMatrix<f64>> {
        self.has_jacobian.then_some(&self.jacobian)
    }

    /// Rate estimate seeding the next solve.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Record the rate measured by a solve.
    pub fn record_rate(&mut self, rate: f64) {
        self.rate = rate;
        self.measured_rate = rate;
    }

    pub fn plan(
        &self,
        reuse: &JacobianReuse,
        gamma: f64,
        step: u64,
        hint: SetupHint,
        tracks_gamma: bool,
    ) -> SetupPlan {
        let reevaluate = !self.has_jacobian
            || step >= self.step_jacobian + reuse.msbj
            || self.measured_rate > reuse.rate_threshold
            || hint == SetupHint::AfterErrorFailure;
        let refactor = reevaluate
            || !self.factored
            || hint != SetupHint::None
            || step >= self.step_setup + reuse.msbp
            || (gamma / self.gamma_factored - 1.0).abs() > reuse.dgmax;
        SetupPlan {
            refactor,
            reevaluate: reevaluate || (refactor && tracks_gamma),
        }
    }

    /// Re-evaluate `J` when requested and factor the iteration matrix.
    pub fn setup<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &DVector<f64>,
        gamma: f64,
        step: u64,
        reevaluate: bool,
    ) -> SolverResult<()> {
        self.factored = false;
        if reevaluate {
            self.has_jacobian = false;
            system.jacobian(delta, &mut self.jacobian)?;
            self.has_jacobian = true;
            self.step_jacobian = step;
            self.measured_rate = 0.0;
        }
        system.newton_matrix(&self.jacobian, gamma, &mut self.matrix);
        self.linear.setup(&self.matrix)?;
        self.factored = true;
        self.gamma_factored = gamma;
        self.step_setup = step;
        self.rate = 1.0;
        Ok(())
    }

    /// Solve `M x = b` in place with the current factorization.
    pub fn solve(&self, b: &mut DVector<f64>) -> SolverResult<()> {
        self.linear.solve(b)
    }
}
