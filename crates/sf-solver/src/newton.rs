//! Modified Newton iteration with a reused, factored iteration matrix.

use crate::cache::{JacobianCache, JacobianReuse, SetupPlan};
use crate::convergence::{ConvergenceConfig, ConvergenceInfo, ConvergenceTest, Verdict};
use crate::error::{SolverError, SolverResult};
use crate::linear::LinearSolverKind;
use crate::nonlinear::{
    NonlinearFailure, NonlinearOutcome, NonlinearSolver, NonlinearStats, NonlinearSystem,
    SolveRequest,
};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use sf_core::VectorOps;
use tracing::{debug, trace};

/// Newton solver configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    /// Maximum iterations per solve
    pub max_iterations: usize,
    pub convergence: ConvergenceConfig,
    pub reuse: JacobianReuse,
    pub linear: LinearSolverKind,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            convergence: ConvergenceConfig::default(),
            reuse: JacobianReuse::default(),
            linear: LinearSolverKind::Dense,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewtonSolver {
    config: NewtonConfig,
    cache: JacobianCache,
    residual: DVector<f64>,
    start: DVector<f64>,
    info: ConvergenceInfo,
    stats: NonlinearStats,
}

impl NewtonSolver {
    pub fn new(config: NewtonConfig, size: usize) -> Self {
        let cache = JacobianCache::new(config.linear, size);
        Self {
            config,
            cache,
            residual: DVector::zeros(size),
            start: DVector::zeros(size),
            info: ConvergenceInfo::default(),
            stats: NonlinearStats::default(),
        }
    }

    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    pub fn cache(&self) -> &JacobianCache {
        &self.cache
    }

    fn setup<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &DVector<f64>,
        gamma: f64,
        step: u64,
        plan: SetupPlan,
    ) -> SolverResult<()> {
        if plan.reevaluate {
            self.stats.jacobian_evals += 1;
            debug!(step, gamma, "re-evaluating Jacobian");
        }
        self.stats.linear_setups += 1;
        self.cache
            .setup(system, delta, gamma, step, plan.reevaluate)
    }

    /// Run at most `max_iterations` corrections with the current matrix.
    fn iterate<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &mut DVector<f64>,
        tol: f64,
    ) -> SolverResult<NonlinearOutcome> {
        let mut test = ConvergenceTest::new(&self.config.convergence, tol, self.cache.rate());
        let mut outcome = NonlinearOutcome::Failed(NonlinearFailure::TooManyIterations);

        for m in 0..self.config.max_iterations {
            if let Err(e) = system.residual(delta, &mut self.residual) {
                if e.is_recoverable() {
                    outcome = NonlinearOutcome::Failed(NonlinearFailure::Recoverable);
                    break;
                }
                return Err(e.into());
            }
            self.residual.neg_mut();
            self.cache.solve(&mut self.residual)?;
            *delta += &self.residual;
            self.stats.iterations += 1;

            let del = self.residual.wrms_norm(system.weights());
            let verdict = test.check(m, del);
            trace!(iteration = m, del, rate = test.rate(), "newton");
            match verdict {
                Verdict::Converged => {
                    outcome = NonlinearOutcome::Converged { iterations: m + 1 };
                    break;
                }
                Verdict::Diverged => {
                    outcome = NonlinearOutcome::Failed(NonlinearFailure::Diverged);
                    break;
                }
                Verdict::Continue => {}
            }
        }

        if test.measured() {
            self.cache.record_rate(test.rate());
        }
        self.info = test.info();
        Ok(outcome)
    }

    fn fail(&mut self, failure: NonlinearFailure) -> SolverResult<NonlinearOutcome> {
        self.stats.convergence_failures += 1;
        Ok(NonlinearOutcome::Failed(failure))
    }
}

impl NonlinearSolver for NewtonSolver {
    fn solve<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &mut DVector<f64>,
        request: &SolveRequest,
    ) -> SolverResult<NonlinearOutcome> {
        let n = system.size();
        if delta.len() != n || self.residual.len() != n {
            return Err(SolverError::ProblemSetup {
                what: format!(
                    "stage size {} does not match solver size {}",
                    delta.len(),
                    self.residual.len()
                ),
            });
        }

        let gamma = system.gamma();
        let tol = self.config.convergence.tolerance(request.error_scale);
        let mut plan = self.cache.plan(
            &self.config.reuse,
            gamma,
            request.step,
            request.hint,
            system.jacobian_tracks_gamma(),
        );
        self.start.copy_from(delta);

        loop {
            let fresh = plan.reevaluate;
            if plan.refactor {
                match self.setup(system, delta, gamma, request.step, plan) {
                    Ok(()) => {}
                    Err(SolverError::Singular { column }) => {
                        debug!(column, fresh, "singular iteration matrix");
                        if !fresh {
                            plan = SetupPlan::full();
                            continue;
                        }
                        return self.fail(NonlinearFailure::SingularMatrix);
                    }
                    Err(e) if e.is_recoverable() => {
                        self.cache.invalidate();
                        return self.fail(NonlinearFailure::Recoverable);
                    }
                    Err(e) => return Err(e),
                }
            }

            match self.iterate(system, delta, tol)? {
                NonlinearOutcome::Converged { iterations } => {
                    return Ok(NonlinearOutcome::Converged { iterations });
                }
                NonlinearOutcome::Failed(NonlinearFailure::Recoverable) => {
                    return self.fail(NonlinearFailure::Recoverable);
                }
                NonlinearOutcome::Failed(failure) => {
                    if fresh {
                        return self.fail(failure);
                    }
                    debug!(?failure, "retrying with a fresh Jacobian");
                    delta.copy_from(&self.start);
                    plan = SetupPlan::full();
                }
            }
        }
    }

    fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    fn convergence_info(&self) -> ConvergenceInfo {
        self.info
    }

    fn stats(&self) -> &NonlinearStats {
        &self.stats
    }

    fn name(&self) -> &'static str {
        "newton"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use sf_core::{EvalError, EvalResult};

    /// Backward Euler stage for `y' = -k y^2`.
    struct Quadratic {
        k: f64,
        y_pred: f64,
        a: f64,
        gamma: f64,
        weights: DVector<f64>,
        fail_residual: bool,
    }

    impl Quadratic {
        fn new(gamma: f64) -> Self {
            Self {
                k: 1.0,
                y_pred: 1.0,
                a: 0.0,
                gamma,
                weights: DVector::from_element(1, 1e3),
                fail_residual: false,
            }
        }

        fn f(&self, y: f64) -> f64 {
            -self.k * y * y
        }
    }

    impl NonlinearSystem for Quadratic {
        fn size(&self) -> usize {
            1
        }

        fn gamma(&self) -> f64 {
            self.gamma
        }

        fn weights(&self) -> &DVector<f64> {
            &self.weights
        }

        fn residual(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
            if self.fail_residual {
                return Err(EvalError::recoverable("bad state"));
            }
            let z = self.y_pred + delta[0];
            out[0] = delta[0] + self.a - self.gamma * self.f(z);
            Ok(())
        }

        fn fixed_point(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
            let z = self.y_pred + delta[0];
            out[0] = self.gamma * self.f(z) - self.a;
            Ok(())
        }

        fn jacobian(&mut self, delta: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
            jac[(0, 0)] = -2.0 * self.k * (self.y_pred + delta[0]);
            Ok(())
        }
    }

    fn request(step: u64) -> SolveRequest {
        SolveRequest {
            error_scale: 1.0,
            step,
            hint: crate::nonlinear::SetupHint::None,
        }
    }

    #[test]
    fn backward_euler_stage_converges() {
        let mut system = Quadratic::new(0.1);
        let mut solver = NewtonSolver::new(NewtonConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        let outcome = solver.solve(&mut system, &mut delta, &request(0)).unwrap();

        assert!(outcome.is_converged());
        // z = 1 - 0.1 z^2
        let exact = (-1.0 + (1.0f64 + 0.4).sqrt()) / 0.2;
        assert!((1.0 + delta[0] - exact).abs() < 1e-6);
        assert_eq!(solver.stats().jacobian_evals, 1);
        assert_eq!(solver.stats().linear_setups, 1);
    }

    #[test]
    fn factorization_is_reused_on_next_step() {
        let mut system = Quadratic::new(0.1);
        let mut solver = NewtonSolver::new(NewtonConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        solver.solve(&mut system, &mut delta, &request(0)).unwrap();

        system.y_pred = 1.0 + delta[0];
        let mut delta = DVector::zeros(1);
        let outcome = solver.solve(&mut system, &mut delta, &request(1)).unwrap();
        assert!(outcome.is_converged());
        assert_eq!(solver.stats().linear_setups, 1);
    }

    #[test]
    fn recoverable_residual_failure_is_reported() {
        let mut system = Quadratic::new(0.1);
        system.fail_residual = true;
        let mut solver = NewtonSolver::new(NewtonConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        let outcome = solver.solve(&mut system, &mut delta, &request(0)).unwrap();
        assert_eq!(
            outcome,
            NonlinearOutcome::Failed(NonlinearFailure::Recoverable)
        );
        assert_eq!(solver.stats().convergence_failures, 1);
    }

    #[test]
    fn stale_jacobian_is_refreshed_before_failing() {
        let mut system = Quadratic::new(0.1);
        let mut solver = NewtonSolver::new(NewtonConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        solver.solve(&mut system, &mut delta, &request(0)).unwrap();

        // A much stiffer problem leaves the cached matrix badly wrong.
        system.k = 500.0;
        let mut delta = DVector::zeros(1);
        let outcome = solver.solve(&mut system, &mut delta, &request(1)).unwrap();
        assert!(solver.stats().jacobian_evals >= 2);
        if outcome.is_converged() {
            let z = system.y_pred + delta[0];
            assert!((z - 1.0 + 0.1 * 500.0 * z * z).abs() < 1e-3);
        }
    }

    #[test]
    fn invalidate_forces_new_setup() {
        let mut system = Quadratic::new(0.1);
        let mut solver = NewtonSolver::new(NewtonConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        solver.solve(&mut system, &mut delta, &request(0)).unwrap();
        solver.invalidate();
        let mut delta = DVector::zeros(1);
        solver.solve(&mut system, &mut delta, &request(1)).unwrap();
        assert_eq!(solver.stats().linear_setups, 2);
        assert_eq!(solver.stats().jacobian_evals, 2);
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let mut system = Quadratic::new(0.1);
        let mut solver = NewtonSolver::new(NewtonConfig::default(), 2);
        let mut delta = DVector::zeros(1);
        assert!(solver.solve(&mut system, &mut delta, &request(0)).is_err());
    }
}
