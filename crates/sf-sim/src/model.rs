//! Problem traits and the adapters the integrator drives.
//!
//! Callers implement [`OdeSystem`] for `y' = f(t, y)` or [`DaeSystem`] for
//! `F(t, y, y') = 0`. The integrator sees both through [`Model`], which
//! also counts evaluations.

use nalgebra::{DMatrix, DVector};
use sf_core::{EvalError, EvalResult};

/// Explicit system `y' = f(t, y)`.
pub trait OdeSystem {
    fn dimension(&self) -> usize;

    /// Compute `ydot = f(t, y)`.
    fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()>;

    /// Whether [`OdeSystem::jacobian`] is implemented.
    fn has_jacobian(&self) -> bool {
        false
    }

    /// Fill `jac` with `∂f/∂y`.
    fn jacobian(&mut self, _t: f64, _y: &DVector<f64>, _jac: &mut DMatrix<f64>) -> EvalResult<()> {
        Err(EvalError::fatal("analytic Jacobian not provided"))
    }

    fn root_count(&self) -> usize {
        0
    }

    /// Evaluate the root functions `g(t, y)` into `out`.
    fn roots(&mut self, _t: f64, _y: &DVector<f64>, _out: &mut [f64]) -> EvalResult<()> {
        Ok(())
    }
}

/// Implicit system `F(t, y, y') = 0`.
pub trait DaeSystem {
    fn dimension(&self) -> usize;

    /// Compute `out = F(t, y, yp)`.
    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> EvalResult<()>;

    fn has_jacobian(&self) -> bool {
        false
    }

    /// Fill `jac` with `∂F/∂y + cj ∂F/∂y'`.
    fn jacobian(
        &mut self,
        _t: f64,
        _y: &DVector<f64>,
        _yp: &DVector<f64>,
        _cj: f64,
        _jac: &mut DMatrix<f64>,
    ) -> EvalResult<()> {
        Err(EvalError::fatal("analytic Jacobian not provided"))
    }

    fn root_count(&self) -> usize {
        0
    }

    fn roots(&mut self, _t: f64, _y: &DVector<f64>, _out: &mut [f64]) -> EvalResult<()> {
        Ok(())
    }
}

/// Evaluation counts kept by the adapters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvalCounters {
    /// Calls to `rhs` or `residual`.
    pub function: u64,
    /// Calls to the analytic Jacobian.
    pub jacobian: u64,
    /// Calls to the root functions.
    pub roots: u64,
}

/// Problem as driven by the integrator.
pub trait Model {
    fn dimension(&self) -> usize;

    fn is_implicit(&self) -> bool;

    /// `ydot = f(t, y)`; only meaningful for explicit problems.
    fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()>;

    /// `out = F(t, y, yp)`; explicit problems report `yp - f(t, y)`.
    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> EvalResult<()>;

    fn has_jacobian(&self) -> bool;

    /// Explicit: `∂f/∂y`. Implicit: `∂F/∂y + cj ∂F/∂y'`.
    fn jacobian(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        cj: f64,
        jac: &mut DMatrix<f64>,
    ) -> EvalResult<()>;

    fn root_count(&self) -> usize;

    fn roots(&mut self, t: f64, y: &DVector<f64>, out: &mut [f64]) -> EvalResult<()>;

    fn counters(&self) -> EvalCounters;

    fn reset_counters(&mut self);
}

/// [`Model`] adapter for an [`OdeSystem`].
#[derive(Clone, Debug)]
pub struct Explicit<S> {
    system: S,
    counters: EvalCounters,
}

impl<S: OdeSystem> Explicit<S> {
    pub fn new(system: S) -> Self {
        Self {
            system,
            counters: EvalCounters::default(),
        }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn into_inner(self) -> S {
        self.system
    }
}

impl<S: OdeSystem> Model for Explicit<S> {
    fn dimension(&self) -> usize {
        self.system.dimension()
    }

    fn is_implicit(&self) -> bool {
        false
    }

    fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        self.counters.function += 1;
        self.system.rhs(t, y, ydot)
    }

    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> EvalResult<()> {
        self.rhs(t, y, out)?;
        for (o, p) in out.iter_mut().zip(yp.iter()) {
            *o = p - *o;
        }
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        self.system.has_jacobian()
    }

    fn jacobian(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        _yp: &DVector<f64>,
        _cj: f64,
        jac: &mut DMatrix<f64>,
    ) -> EvalResult<()> {
        self.counters.jacobian += 1;
        self.system.jacobian(t, y, jac)
    }

    fn root_count(&self) -> usize {
        self.system.root_count()
    }

    fn roots(&mut self, t: f64, y: &DVector<f64>, out: &mut [f64]) -> EvalResult<()> {
        self.counters.roots += 1;
        self.system.roots(t, y, out)
    }

    fn counters(&self) -> EvalCounters {
        self.counters
    }

    fn reset_counters(&mut self) {
        self.counters = EvalCounters::default();
    }
}

/// [`Model`] adapter for a [`DaeSystem`].
#[derive(Clone, Debug)]
pub struct Implicit<S> {
    system: S,
    counters: EvalCounters,
}

impl<S: DaeSystem> Implicit<S> {
    pub fn new(system: S) -> Self {
        Self {
            system,
            counters: EvalCounters::default(),
        }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn into_inner(self) -> S {
        self.system
    }
}

impl<S: DaeSystem> Model for Implicit<S> {
    fn dimension(&self) -> usize {
        self.system.dimension()
    }

    fn is_implicit(&self) -> bool {
        true
    }

    fn rhs(&mut self, _t: f64, _y: &DVector<f64>, _ydot: &mut DVector<f64>) -> EvalResult<()> {
        Err(EvalError::fatal("implicit problems have no explicit right-hand side"))
    }

    fn residual(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> EvalResult<()> {
        self.counters.function += 1;
        self.system.residual(t, y, yp, out)
    }

    fn has_jacobian(&self) -> bool {
        self.system.has_jacobian()
    }

    fn jacobian(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        cj: f64,
        jac: &mut DMatrix<f64>,
    ) -> EvalResult<()> {
        self.counters.jacobian += 1;
        self.system.jacobian(t, y, yp, cj, jac)
    }

    fn root_count(&self) -> usize {
        self.system.root_count()
    }

    fn roots(&mut self, t: f64, y: &DVector<f64>, out: &mut [f64]) -> EvalResult<()> {
        self.counters.roots += 1;
        self.system.roots(t, y, out)
    }

    fn counters(&self) -> EvalCounters {
        self.counters
    }

    fn reset_counters(&mut self) {
        self.counters = EvalCounters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn explicit_residual_form() {
        let mut model = Explicit::new(Decay);
        let y = DVector::from_element(1, 1.0);
        let yp = DVector::from_element(1, -2.0);
        let mut out = DVector::zeros(1);
        model.residual(0.0, &y, &yp, &mut out).unwrap();
        assert_eq!(out[0], 0.0);
        assert_eq!(model.counters().function, 1);
        assert!(!model.is_implicit());
    }

    #[test]
    fn missing_jacobian_is_fatal() {
        let mut model = Explicit::new(Decay);
        let y = DVector::from_element(1, 1.0);
        let mut jac = DMatrix::zeros(1, 1);
        let err = model.jacobian(0.0, &y, &y, 0.0, &mut jac).unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn counters_reset() {
        let mut model = Explicit::new(Decay);
        let y = DVector::from_element(1, 1.0);
        let mut out = DVector::zeros(1);
        model.rhs(0.0, &y, &mut out).unwrap();
        model.roots(0.0, &y, &mut []).unwrap();
        assert_eq!(model.counters().roots, 1);
        model.reset_counters();
        assert_eq!(model.counters(), EvalCounters::default());
    }
}
