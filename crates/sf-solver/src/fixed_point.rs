//! Functional iteration `δ ← Φ(δ)` with optional Anderson acceleration.

use crate::convergence::{ConvergenceConfig, ConvergenceInfo, ConvergenceTest, Verdict};
use crate::error::{SolverError, SolverResult};
use crate::nonlinear::{
    NonlinearFailure, NonlinearOutcome, NonlinearSolver, NonlinearStats, NonlinearSystem,
    SolveRequest,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sf_core::VectorOps;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedPointConfig {
    pub max_iterations: usize,
    /// Anderson history depth; 0 disables acceleration.
    pub anderson_depth: usize,
    /// Anderson damping in `(0, 1]`.
    pub damping: f64,
    pub convergence: ConvergenceConfig,
}

impl Default for FixedPointConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            anderson_depth: 0,
            damping: 1.0,
            convergence: ConvergenceConfig::default(),
        }
    }
}

/// Differences of `Φ` values and residuals from recent iterations.
#[derive(Clone, Debug, Default)]
struct AndersonHistory {
    dg: VecDeque<DVector<f64>>,
    df: VecDeque<DVector<f64>>,
}

impl AndersonHistory {
    fn clear(&mut self) {
        self.dg.clear();
        self.df.clear();
    }

    fn push(&mut self, depth: usize, dg: DVector<f64>, df: DVector<f64>) {
        if self.dg.len() == depth {
            self.dg.pop_front();
            self.df.pop_front();
        }
        self.dg.push_back(dg);
        self.df.push_back(df);
    }

    /// Accelerated iterate from `g = Φ(x)` and `f = g - x`.
    fn extrapolate(&self, g: &DVector<f64>, f: &DVector<f64>, damping: f64) -> DVector<f64> {
        let mut next = g.clone();
        if self.df.is_empty() {
            return next;
        }
        let n = f.len();
        let df = DMatrix::from_fn(n, self.df.len(), |i, j| self.df[j][i]);
        let coeffs = match df.svd(true, true).solve(f, 1e-14) {
            Ok(c) => c,
            Err(_) => return next,
        };
        let mut f_star = f.clone();
        for (j, c) in coeffs.iter().enumerate() {
            next.axpy(-c, &self.dg[j], 1.0);
            f_star.axpy(-c, &self.df[j], 1.0);
        }
        if damping < 1.0 {
            next.axpy(-(1.0 - damping), &f_star, 1.0);
        }
        next
    }
}

#[derive(Clone, Debug)]
pub struct FixedPointSolver {
    config: FixedPointConfig,
    g: DVector<f64>,
    history: AndersonHistory,
    rate: f64,
    info: ConvergenceInfo,
    stats: NonlinearStats,
}

impl FixedPointSolver {
    pub fn new(config: FixedPointConfig, size: usize) -> Self {
        Self {
            config,
            g: DVector::zeros(size),
            history: AndersonHistory::default(),
            rate: 1.0,
            info: ConvergenceInfo::default(),
            stats: NonlinearStats::default(),
        }
    }

    fn fail(&mut self, failure: NonlinearFailure) -> SolverResult<NonlinearOutcome> {
        self.stats.convergence_failures += 1;
        Ok(NonlinearOutcome::Failed(failure))
    }
}

impl NonlinearSolver for FixedPointSolver {
    fn solve<S: NonlinearSystem>(
        &mut self,
        system: &mut S,
        delta: &mut DVector<f64>,
        request: &SolveRequest,
    ) -> SolverResult<NonlinearOutcome> {
        if delta.len() != system.size() || self.g.len() != system.size() {
            return Err(SolverError::ProblemSetup {
                what: format!(
                    "stage size {} does not match solver size {}",
                    delta.len(),
                    self.g.len()
                ),
            });
        }

        let tol = self.config.convergence.tolerance(request.error_scale);
        let mut test = ConvergenceTest::new(&self.config.convergence, tol, self.rate);
        let depth = self.config.anderson_depth;
        self.history.clear();
        let mut prev: Option<(DVector<f64>, DVector<f64>)> = None;
        let mut outcome = NonlinearOutcome::Failed(NonlinearFailure::TooManyIterations);

        for m in 0..self.config.max_iterations {
            if let Err(e) = system.fixed_point(delta, &mut self.g) {
                if e.is_recoverable() {
                    outcome = NonlinearOutcome::Failed(NonlinearFailure::Recoverable);
                    break;
                }
                return Err(e.into());
            }
            self.stats.iterations += 1;

            let next = if depth > 0 {
                let f = &self.g - &*delta;
                if let Some((g_prev, f_prev)) = prev.take() {
                    self.history.push(depth, &self.g - g_prev, &f - f_prev);
                }
                let next = self.history.extrapolate(&self.g, &f, self.config.damping);
                prev = Some((self.g.clone(), f));
                next
            } else {
                self.g.clone()
            };

            let correction = &next - &*delta;
            let del = correction.wrms_norm(system.weights());
            delta.copy_from(&next);

            let verdict = test.check(m, del);
            trace!(iteration = m, del, rate = test.rate(), "fixed point");
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
            self.rate = test.rate();
        }
        self.info = test.info();
        match outcome {
            NonlinearOutcome::Failed(failure) => self.fail(failure),
            converged => Ok(converged),
        }
    }

    fn invalidate(&mut self) {
        self.rate = 1.0;
        self.history.clear();
    }

    fn convergence_info(&self) -> ConvergenceInfo {
        self.info
    }

    fn stats(&self) -> &NonlinearStats {
        &self.stats
    }

    fn name(&self) -> &'static str {
        "fixed_point"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonlinear::SetupHint;
    use sf_core::{EvalError, EvalResult};

    /// Backward Euler stage for the linear system `y' = A y`.
    struct LinearStage {
        a: DMatrix<f64>,
        y_pred: DVector<f64>,
        gamma: f64,
        weights: DVector<f64>,
        fail: bool,
    }

    impl LinearStage {
        fn new(a: DMatrix<f64>, gamma: f64) -> Self {
            let n = a.nrows();
            Self {
                a,
                y_pred: DVector::from_element(n, 1.0),
                gamma,
                weights: DVector::from_element(n, 1e6),
                fail: false,
            }
        }
    }

    impl NonlinearSystem for LinearStage {
        fn size(&self) -> usize {
            self.a.nrows()
        }

        fn gamma(&self) -> f64 {
            self.gamma
        }

        fn weights(&self) -> &DVector<f64> {
            &self.weights
        }

        fn residual(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
            let z = &self.y_pred + delta;
            out.copy_from(&(delta - self.gamma * (&self.a * z)));
            Ok(())
        }

        fn fixed_point(&mut self, delta: &DVector<f64>, out: &mut DVector<f64>) -> EvalResult<()> {
            if self.fail {
                return Err(EvalError::recoverable("outside domain"));
            }
            let z = &self.y_pred + delta;
            out.copy_from(&(self.gamma * (&self.a * z)));
            Ok(())
        }

        fn jacobian(&mut self, _delta: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
            jac.copy_from(&self.a);
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

    fn exact(stage: &LinearStage) -> DVector<f64> {
        let n = stage.size();
        let m = DMatrix::identity(n, n) - stage.gamma * &stage.a;
        let z = m.lu().solve(&stage.y_pred).unwrap();
        z - &stage.y_pred
    }

    #[test]
    fn contractive_map_converges() {
        let a = DMatrix::from_row_slice(2, 2, &[-1.0, 0.5, 0.0, -2.0]);
        let mut stage = LinearStage::new(a, 0.05);
        let mut solver = FixedPointSolver::new(FixedPointConfig::default(), 2);
        let mut delta = DVector::zeros(2);
        let outcome = solver.solve(&mut stage, &mut delta, &request()).unwrap();

        assert!(outcome.is_converged());
        let expected = exact(&stage);
        assert!((&delta - expected).amax() < 1e-6);
        assert_eq!(solver.stats().jacobian_evals, 0);
    }

    #[test]
    fn anderson_needs_fewer_iterations() {
        let a = DMatrix::from_row_slice(3, 3, &[-8.0, 1.0, 0.0, 1.0, -6.0, 1.0, 0.0, 1.0, -7.0]);
        let mut plain_stage = LinearStage::new(a.clone(), 0.05);
        let mut plain = FixedPointSolver::new(
            FixedPointConfig {
                max_iterations: 60,
                ..FixedPointConfig::default()
            },
            3,
        );
        let mut delta = DVector::zeros(3);
        let plain_outcome = plain.solve(&mut plain_stage, &mut delta, &request()).unwrap();

        let mut accel_stage = LinearStage::new(a, 0.05);
        let mut accel = FixedPointSolver::new(
            FixedPointConfig {
                max_iterations: 60,
                anderson_depth: 3,
                ..FixedPointConfig::default()
            },
            3,
        );
        let mut delta_acc = DVector::zeros(3);
        let accel_outcome = accel.solve(&mut accel_stage, &mut delta_acc, &request()).unwrap();

        assert!(plain_outcome.is_converged());
        assert!(accel_outcome.is_converged());
        assert!(accel.stats().iterations < plain.stats().iterations);
        assert!((&delta_acc - exact(&accel_stage)).amax() < 1e-6);
    }

    #[test]
    fn expanding_map_is_reported_as_failure() {
        let a = DMatrix::from_element(1, 1, -50.0);
        let mut stage = LinearStage::new(a, 0.1);
        let mut solver = FixedPointSolver::new(FixedPointConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        let outcome = solver.solve(&mut stage, &mut delta, &request()).unwrap();
        assert_eq!(outcome, NonlinearOutcome::Failed(NonlinearFailure::Diverged));
        assert_eq!(solver.stats().convergence_failures, 1);
    }

    #[test]
    fn recoverable_failure_passes_through() {
        let a = DMatrix::from_element(1, 1, -1.0);
        let mut stage = LinearStage::new(a, 0.1);
        stage.fail = true;
        let mut solver = FixedPointSolver::new(FixedPointConfig::default(), 1);
        let mut delta = DVector::zeros(1);
        let outcome = solver.solve(&mut stage, &mut delta, &request()).unwrap();
        assert_eq!(
            outcome,
            NonlinearOutcome::Failed(NonlinearFailure::Recoverable)
        );
    }
}
