//! The integration driver.
//!
//! [`Integrator`] owns the solution, the step method history, the stage
//! solver and the controller, and advances them one internal step at a
//! time: attempt, error test, then accept or retry with a smaller step.

use crate::controller::{Controller, StepSample};
use crate::error::{IntegratorError, SimResult};
use crate::estimator::ErrorEstimator;
use crate::initial_step;
use crate::method::{Attempt, Method};
use crate::model::{DaeSystem, Explicit, Implicit, Model, OdeSystem};
use crate::options::IntegratorOptions;
use crate::roots::{RootCrossing, RootFinder};
use crate::stage::{StageContext, evaluation_failure};
use crate::stats::IntegratorStats;
use nalgebra::DVector;
use sf_core::{UNIT_ROUNDOFF, VectorOps, ensure_finite_vector, time_roundoff};
use sf_solver::{
    LinearSolverKind, NonlinearBackend, NonlinearFailure, NonlinearSolver, SetupHint,
};
use tracing::{debug, info, warn};

/// How far one [`Integrator::advance`] call goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Task {
    /// Step past `tout`, then interpolate back to it.
    #[default]
    Normal,
    /// Take one internal step.
    OneStep,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AdvanceStatus {
    Reached,
    /// The stop time was reached and has been cleared.
    StopTime,
    /// Root functions crossed zero at the returned time.
    Root(Vec<RootCrossing>),
}

/// Outcome of a successful [`Integrator::advance`].
#[derive(Clone, Debug, PartialEq)]
pub struct Advance {
    /// Time the output buffer holds the solution at.
    pub t: f64,
    pub status: AdvanceStatus,
}

/// Counters the driver keeps itself.
#[derive(Clone, Debug, Default)]
struct Counters {
    step_attempts: u64,
    step_convergence_failures: u64,
    error_test_failures: u64,
    recoverable_failures: u64,
    fd_evals: u64,
    h_initial: f64,
    order_last: usize,
    error_norm_last: f64,
    tolerance_scale: f64,
}

/// Adaptive integrator for `y' = f(t, y)` or `F(t, y, y') = 0`.
pub struct Integrator<M: Model> {
    model: M,
    options: IntegratorOptions,
    method: Method,
    solver: NonlinearBackend,
    controller: Controller,
    estimator: ErrorEstimator,
    roots: RootFinder,
    bandwidth: Option<(usize, usize)>,
    ewt: DVector<f64>,
    /// Initial slope: `f(t0, y0)` or the given `y'(t0)`.
    dy0: DVector<f64>,
    t0: f64,
    /// Next step size; zero until the first step is sized.
    h: f64,
    h_last: f64,
    stop_time: Option<f64>,
    /// Accepted steps since the last (re)initialization.
    step: u64,
    hint: SetupHint,
    hnil_warnings: u32,
    counters: Counters,
    scratch: DVector<f64>,
}

impl<S: OdeSystem> Integrator<Explicit<S>> {
    /// Integrator for an explicit system starting from `(t0, y0)`.
    pub fn new(
        system: S,
        t0: f64,
        y0: &DVector<f64>,
        options: IntegratorOptions,
    ) -> SimResult<Self> {
        let mut integrator = Self::build(Explicit::new(system), options)?;
        integrator.start(t0, y0, None)?;
        Ok(integrator)
    }

    /// Restart from `(t0, y0)`, keeping options and problem.
    pub fn reinit(&mut self, t0: f64, y0: &DVector<f64>) -> SimResult<()> {
        self.start(t0, y0, None)
    }
}

impl<S: DaeSystem> Integrator<Implicit<S>> {
    /// Integrator for an implicit system from consistent `(t0, y0, yp0)`.
    pub fn new_implicit(
        system: S,
        t0: f64,
        y0: &DVector<f64>,
        yp0: &DVector<f64>,
        options: IntegratorOptions,
    ) -> SimResult<Self> {
        let mut integrator = Self::build(Implicit::new(system), options)?;
        integrator.start(t0, y0, Some(yp0))?;
        Ok(integrator)
    }

    pub fn reinit_implicit(
        &mut self,
        t0: f64,
        y0: &DVector<f64>,
        yp0: &DVector<f64>,
    ) -> SimResult<()> {
        self.start(t0, y0, Some(yp0))
    }
}

impl<M: Model> Integrator<M> {
    fn build(model: M, options: IntegratorOptions) -> SimResult<Self> {
        let n = model.dimension();
        options.validate(n, model.root_count(), model.is_implicit())?;
        let bandwidth = match options.linear_solver() {
            Some(LinearSolverKind::Banded { upper, lower }) => Some((upper, lower)),
            _ => None,
        };
        Ok(Self {
            method: Method::new(&options.method, n),
            solver: NonlinearBackend::from_kind(&options.nonlinear, n),
            controller: Controller::new(options.controller.clone()),
            estimator: ErrorEstimator::new(options.error_accumulation),
            roots: RootFinder::new(model.root_count(), &options.root_directions),
            bandwidth,
            ewt: DVector::zeros(n),
            dy0: DVector::zeros(n),
            t0: 0.0,
            h: 0.0,
            h_last: 0.0,
            stop_time: None,
            step: 0,
            hint: SetupHint::None,
            hnil_warnings: 0,
            counters: Counters::default(),
            scratch: DVector::zeros(n),
            model,
            options,
        })
    }

    /// Reset all state and statistics at `(t0, y0)`.
    fn start(&mut self, t0: f64, y0: &DVector<f64>, yp0: Option<&DVector<f64>>) -> SimResult<()> {
        let n = self.model.dimension();
        if y0.len() != n {
            return Err(IntegratorError::invalid(format!(
                "y0 has length {}, expected {n}",
                y0.len()
            )));
        }
        if !t0.is_finite() {
            return Err(IntegratorError::invalid("t0 must be finite"));
        }
        ensure_finite_vector(y0, "y0").map_err(|e| IntegratorError::invalid(e.to_string()))?;
        if let Some(ts) = self.options.stop_time {
            if ts <= t0 {
                return Err(IntegratorError::invalid(format!(
                    "stop time {ts} must lie beyond t0 = {t0}"
                )));
            }
        }

        self.model.reset_counters();
        self.solver = NonlinearBackend::from_kind(&self.options.nonlinear, n);
        self.controller.reset();
        self.estimator.reset();
        self.counters = Counters::default();
        self.t0 = t0;
        self.h = 0.0;
        self.h_last = 0.0;
        self.stop_time = self.options.stop_time;
        self.step = 0;
        self.hint = SetupHint::None;
        self.hnil_warnings = 0;

        self.options
            .tolerances
            .error_weights(y0, &mut self.ewt)
            .map_err(|e| IntegratorError::invalid(e.to_string()))?;

        match yp0 {
            Some(yp0) => {
                if yp0.len() != n {
                    return Err(IntegratorError::invalid(format!(
                        "yp0 has length {}, expected {n}",
                        yp0.len()
                    )));
                }
                ensure_finite_vector(yp0, "yp0")
                    .map_err(|e| IntegratorError::invalid(e.to_string()))?;
                self.model
                    .residual(t0, y0, yp0, &mut self.scratch)
                    .map_err(|e| evaluation_failure(t0, e))?;
                let residual = self.scratch.max_norm();
                if !(residual <= self.options.initial_residual_tolerance) {
                    return Err(IntegratorError::invalid(format!(
                        "initial conditions are inconsistent: max |F(t0, y0, yp0)| = {residual:e}"
                    )));
                }
                self.dy0.copy_from(yp0);
            }
            None => {
                self.model
                    .rhs(t0, y0, &mut self.dy0)
                    .map_err(|e| evaluation_failure(t0, e))?;
            }
        }

        self.method.initialize(t0, y0, &self.dy0, 0.0);
        let model = &mut self.model;
        self.roots.initialize(t0, |t, out| {
            model
                .roots(t, y0, out)
                .map_err(|e| IntegratorError::RootFunction {
                    t,
                    what: e.to_string(),
                })
        })?;

        info!(
            t0,
            n,
            method = self.method.name(),
            solver = self.solver.name(),
            "integrator initialized"
        );
        Ok(())
    }

    /// Advance towards `tout` and write the solution into `yout`.
    ///
    /// On error `yout` holds the last committed solution, which also stays
    /// available through [`Integrator::solution`].
    pub fn advance(
        &mut self,
        tout: f64,
        task: Task,
        yout: &mut DVector<f64>,
    ) -> SimResult<Advance> {
        if yout.len() != self.model.dimension() {
            return Err(IntegratorError::invalid(format!(
                "output buffer has length {}, expected {}",
                yout.len(),
                self.model.dimension()
            )));
        }
        let result = self.advance_inner(tout, task, yout);
        if result.is_err() {
            yout.copy_from(self.method.current());
        }
        result
    }

    fn advance_inner(
        &mut self,
        tout: f64,
        task: Task,
        yout: &mut DVector<f64>,
    ) -> SimResult<Advance> {
        if !tout.is_finite() {
            return Err(IntegratorError::invalid("tout must be finite"));
        }
        if self.h == 0.0 {
            self.size_first_step(tout)?;
        }

        let t_n = self.method.t();
        if task == Task::Normal {
            let t_lo = t_n - self.h_last;
            if tout < t_lo - time_roundoff(t_n, self.h_last) {
                return Err(IntegratorError::invalid(format!(
                    "tout = {tout} lies behind the current step [{t_lo}, {t_n}]"
                )));
            }
        }

        // a root returned earlier may leave part of the last step unsearched
        if self.step > 0 && self.roots.count() > 0 && self.roots.t_lo() < t_n {
            let limit = if task == Task::Normal { tout.min(t_n) } else { t_n };
            if let Some(found) = self.search_roots(limit, yout)? {
                return Ok(found);
            }
        }

        if task == Task::Normal && tout <= t_n && self.step > 0 {
            self.method.interpolate(tout, yout)?;
            return Ok(Advance {
                t: tout,
                status: AdvanceStatus::Reached,
            });
        }

        // an earlier call may have stepped onto the stop time while returning
        // an interpolated output before it
        if let Some(ts) = self.stop_time {
            if self.step > 0 && (t_n - ts).abs() <= time_roundoff(t_n, self.h) {
                self.method.snap_time(ts);
                return Ok(self.stop_at(yout));
            }
        }

        let mut taken = 0u64;
        loop {
            let t_n = self.method.t();
            if taken >= self.options.max_steps {
                return Err(IntegratorError::TooMuchWork {
                    t: t_n,
                    steps: taken,
                });
            }

            let tolsf = UNIT_ROUNDOFF * self.method.current().wrms_norm(&self.ewt);
            if tolsf > 1.0 {
                self.counters.tolerance_scale = 2.0 * tolsf;
                return Err(IntegratorError::TooMuchAccuracy {
                    t: t_n,
                    factor: 2.0 * tolsf,
                });
            }

            if t_n + self.h == t_n {
                self.hnil_warnings += 1;
                let limit = self.options.max_hnil_warnings;
                if self.hnil_warnings <= limit {
                    warn!(t = t_n, h = self.h, "t + h == t; the step is below roundoff");
                }
                if self.hnil_warnings == limit {
                    warn!("further t + h == t warnings suppressed");
                }
            }

            if let Some(ts) = self.stop_time {
                if t_n + self.h > ts {
                    self.h = (ts - t_n) * (1.0 - 4.0 * UNIT_ROUNDOFF);
                }
            }

            self.take_step()?;
            taken += 1;

            let t_n = self.method.t();
            if let Some(ts) = self.stop_time {
                if (t_n - ts).abs() <= time_roundoff(t_n, self.h_last) {
                    self.method.snap_time(ts);
                }
            }
            let t_n = self.method.t();

            if self.roots.count() > 0 {
                let limit = if task == Task::Normal { tout.min(t_n) } else { t_n };
                if let Some(found) = self.search_roots(limit, yout)? {
                    return Ok(found);
                }
            }

            if task == Task::Normal && tout < t_n {
                self.method.interpolate(tout, yout)?;
                return Ok(Advance {
                    t: tout,
                    status: AdvanceStatus::Reached,
                });
            }

            if self.stop_time == Some(t_n) {
                return Ok(self.stop_at(yout));
            }

            if task == Task::OneStep || tout == t_n {
                yout.copy_from(self.method.current());
                return Ok(Advance {
                    t: t_n,
                    status: AdvanceStatus::Reached,
                });
            }
        }
    }

    fn stop_at(&mut self, yout: &mut DVector<f64>) -> Advance {
        let t = self.method.t();
        self.stop_time = None;
        yout.copy_from(self.method.current());
        debug!(t, "stop time reached");
        Advance {
            t,
            status: AdvanceStatus::StopTime,
        }
    }

    /// Pick and commit the first step size for output time `tout`.
    fn size_first_step(&mut self, tout: f64) -> SimResult<()> {
        let t0 = self.t0;
        if tout <= t0 {
            return Err(IntegratorError::invalid(format!(
                "tout = {tout} must lie beyond t0 = {t0}; integration runs forward only"
            )));
        }

        let mut h = match self.options.h_init {
            Some(h) => h,
            None if self.model.is_implicit() => {
                initial_step::estimate_implicit(t0, &self.dy0, &self.ewt, tout)?
            }
            None => {
                let y0 = self.method.current().clone();
                initial_step::estimate_explicit(
                    &mut self.model,
                    t0,
                    &y0,
                    &self.dy0,
                    &self.ewt,
                    tout,
                )?
            }
        };
        if let Some(ts) = self.stop_time {
            if t0 + h > ts {
                h = (ts - t0) * (1.0 - 4.0 * UNIT_ROUNDOFF);
            }
        }
        h = self.controller.clamp(h);

        let y0 = self.method.current().clone();
        self.method.initialize(t0, &y0, &self.dy0, h);
        self.h = h;
        self.counters.h_initial = h;
        info!(t0, h0 = h, "initial step size");
        Ok(())
    }

    /// One internal step, retrying after failures until it is accepted or a
    /// failure bound is hit.
    fn take_step(&mut self) -> SimResult<()> {
        let config = self.controller.config().clone();
        let floor = config.h_min * (1.0 + 4.0 * UNIT_ROUNDOFF);
        let mut h = self.h;
        let mut error_failures = 0u32;
        let mut convergence_failures = 0u32;
        let mut recoverable = 0u32;
        let mut retried = false;

        loop {
            let t_n = self.method.t();
            if !(h > 0.0 && h.is_finite()) {
                return Err(IntegratorError::StepSizeFloor { t: t_n, h });
            }
            self.counters.step_attempts += 1;

            let mut ctx = StageContext {
                model: &mut self.model,
                solver: &mut self.solver,
                ewt: &self.ewt,
                bandwidth: self.bandwidth,
                step: self.step,
                hint: self.hint,
                fd_evals: 0,
            };
            let attempt = self.method.attempt(&mut ctx, h);
            self.counters.fd_evals += ctx.fd_evals;

            match attempt? {
                Attempt::Failed(failure) => {
                    retried = true;
                    let is_recoverable = matches!(
                        failure,
                        NonlinearFailure::Recoverable | NonlinearFailure::SingularMatrix
                    );
                    debug!(t = t_n, h, ?failure, "stage solve failed");
                    if is_recoverable {
                        self.counters.recoverable_failures += 1;
                        recoverable += 1;
                        if recoverable <= config.max_recoverable_failures {
                            if h.abs() <= floor {
                                return Err(IntegratorError::StepSizeFloor { t: t_n, h });
                            }
                            h = self.controller.after_recoverable_failure(h);
                            self.hint = SetupHint::AfterConvergenceFailure;
                            continue;
                        }
                    }

                    self.counters.step_convergence_failures += 1;
                    convergence_failures += 1;
                    if convergence_failures >= config.max_convergence_failures {
                        return Err(IntegratorError::ConvergenceFailures {
                            t: t_n,
                            failures: convergence_failures,
                        });
                    }
                    if h.abs() <= floor {
                        return Err(IntegratorError::StepSizeFloor { t: t_n, h });
                    }
                    h = self.controller.after_convergence_failure(h);
                    self.hint = SetupHint::AfterConvergenceFailure;
                }
                Attempt::Solved { orders } => {
                    let error_norm = self
                        .estimator
                        .norm(self.method.local_error(), &self.ewt);
                    let order = self.method.error_order();
                    let sample = StepSample {
                        error_norm,
                        h,
                        order,
                        failures: error_failures,
                        retried,
                        first_step: self.step == 0,
                        orders,
                    };
                    let decision = self.controller.update(&sample);
                    self.counters.error_norm_last = error_norm;

                    if !decision.accept {
                        debug!(t = t_n, h, error_norm, eta = decision.eta, "error test failed");
                        self.counters.error_test_failures += 1;
                        error_failures += 1;
                        retried = true;
                        if error_failures >= config.max_error_failures {
                            return Err(IntegratorError::ErrorTestFailures {
                                t: t_n,
                                failures: error_failures,
                            });
                        }
                        if h.abs() <= floor {
                            return Err(IntegratorError::StepSizeFloor { t: t_n, h });
                        }
                        h = decision.h_next;
                        self.hint = SetupHint::AfterErrorFailure;
                        continue;
                    }

                    self.counters.order_last = self.method.order();
                    self.method.accept(&decision);
                    self.estimator.record(error_norm);
                    self.step += 1;
                    self.h_last = h;
                    self.h = decision.h_next;
                    self.hint = SetupHint::None;
                    self.options
                        .tolerances
                        .error_weights(self.method.current(), &mut self.ewt)?;
                    debug!(
                        t = self.method.t(),
                        h,
                        order,
                        error_norm,
                        h_next = self.h,
                        "step accepted"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Search `(t_lo, limit]` for roots and report the first one found.
    fn search_roots(&mut self, limit: f64, yout: &mut DVector<f64>) -> SimResult<Option<Advance>> {
        let model = &mut self.model;
        let method = &self.method;
        let y = &mut self.scratch;
        let found = self.roots.search(limit, |t, out| {
            method.interpolate(t, y)?;
            model
                .roots(t, y, out)
                .map_err(|e| IntegratorError::RootFunction {
                    t,
                    what: e.to_string(),
                })
        })?;

        match found {
            Some((t_root, crossings)) => {
                self.method.interpolate(t_root, yout)?;
                debug!(t = t_root, roots = crossings.len(), "root found");
                Ok(Some(Advance {
                    t: t_root,
                    status: AdvanceStatus::Root(crossings),
                }))
            }
            None => Ok(None),
        }
    }

    /// Dense output at `t` within the last step.
    pub fn interpolate(&self, t: f64, out: &mut DVector<f64>) -> SimResult<()> {
        if out.len() != self.model.dimension() {
            return Err(IntegratorError::invalid("output buffer has the wrong length"));
        }
        self.method.interpolate(t, out)
    }

    /// Stop exactly at `ts`; cleared once reached.
    pub fn set_stop_time(&mut self, ts: f64) -> SimResult<()> {
        let t = self.method.t();
        if !(ts > t) {
            return Err(IntegratorError::invalid(format!(
                "stop time {ts} must lie beyond the current time {t}"
            )));
        }
        self.stop_time = Some(ts);
        Ok(())
    }

    pub fn stats(&self) -> IntegratorStats {
        let counters = self.model.counters();
        let nls = self.solver.stats();
        IntegratorStats {
            steps: self.step,
            step_attempts: self.counters.step_attempts,
            rhs_evals: counters.function,
            rhs_evals_jacobian: self.counters.fd_evals,
            jacobian_evals: nls.jacobian_evals,
            linear_setups: nls.linear_setups,
            nonlinear_iterations: nls.iterations,
            nonlinear_convergence_failures: nls.convergence_failures,
            step_convergence_failures: self.counters.step_convergence_failures,
            error_test_failures: self.counters.error_test_failures,
            recoverable_failures: self.counters.recoverable_failures,
            root_evals: counters.roots,
            h_initial: self.counters.h_initial,
            h_last: self.h_last,
            h_next: self.h,
            t_current: self.method.t(),
            order_last: self.counters.order_last,
            order_next: self.method.order(),
            error_norm_last: self.counters.error_norm_last,
            accumulated_error: self.estimator.accumulated(),
            tolerance_scale: self.counters.tolerance_scale,
        }
    }

    /// Time of the last committed step.
    pub fn t(&self) -> f64 {
        self.method.t()
    }

    /// Solution at [`Integrator::t`].
    pub fn solution(&self) -> &DVector<f64> {
        self.method.current()
    }

    /// Step size the next attempt will use.
    pub fn current_step(&self) -> f64 {
        self.h
    }

    pub fn current_order(&self) -> usize {
        self.method.order()
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_core::EvalResult;

    struct Decay(f64);

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
            ydot[0] = -self.0 * y[0];
            Ok(())
        }
    }

    fn decay(options: IntegratorOptions) -> Integrator<Explicit<Decay>> {
        Integrator::new(Decay(1.0), 0.0, &DVector::from_element(1, 1.0), options).unwrap()
    }

    #[test]
    fn wrong_lengths_are_invalid_input() {
        let err = Integrator::new(
            Decay(1.0),
            0.0,
            &DVector::from_element(2, 1.0),
            IntegratorOptions::bdf(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, IntegratorError::InvalidInput { .. }));

        let mut integrator = decay(IntegratorOptions::bdf());
        let mut y = DVector::zeros(3);
        assert!(integrator.advance(1.0, Task::Normal, &mut y).is_err());
    }

    #[test]
    fn backwards_tout_is_rejected() {
        let mut integrator = decay(IntegratorOptions::bdf());
        let mut y = DVector::zeros(1);
        let err = integrator.advance(-1.0, Task::Normal, &mut y).unwrap_err();
        assert!(matches!(err, IntegratorError::InvalidInput { .. }));
        assert_eq!(y[0], 1.0);
    }

    #[test]
    fn normal_task_interpolates_to_tout() {
        let mut integrator = decay(IntegratorOptions::bdf().with_tolerances(1e-8, 1e-10));
        let mut y = DVector::zeros(1);
        let adv = integrator.advance(0.5, Task::Normal, &mut y).unwrap();
        assert_eq!(adv.t, 0.5);
        assert_eq!(adv.status, AdvanceStatus::Reached);
        assert!(integrator.t() >= 0.5);
        assert!((y[0] - (-0.5f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn stop_time_must_lie_ahead() {
        let mut integrator = decay(IntegratorOptions::bdf());
        assert!(integrator.set_stop_time(0.0).is_err());
        assert!(integrator.set_stop_time(0.25).is_ok());
    }

    #[test]
    fn max_steps_bounds_one_call() {
        let mut options = IntegratorOptions::bdf();
        options.max_steps = 3;
        options.h_init = Some(1e-6);
        let mut integrator = decay(options);
        let mut y = DVector::zeros(1);
        let err = integrator.advance(10.0, Task::Normal, &mut y).unwrap_err();
        assert!(matches!(err, IntegratorError::TooMuchWork { steps: 3, .. }));
        assert_eq!(integrator.stats().steps, 3);
        assert_eq!(y[0], integrator.solution()[0]);
    }
}
