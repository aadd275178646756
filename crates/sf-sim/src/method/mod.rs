//! Step methods: variable-order BDF and embedded DIRK.
//!
//! A method owns its history and dense-output data. The integrator asks it
//! to attempt a step of size `h` from its current time, then either
//! accepts the attempt (committing history) or retries with a new `h`.

pub mod bdf;
pub mod dirk;
pub mod tableau;

use crate::controller::{OrderSelection, StepDecision};
use crate::error::SimResult;
use crate::model::Model;
use crate::options::MethodKind;
use crate::stage::StageContext;
use nalgebra::DVector;
use sf_solver::NonlinearFailure;

pub use bdf::Bdf;
pub use dirk::Dirk;

/// Result of one step attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Attempt {
    /// Stages converged; the local error is available.
    Solved { orders: OrderSelection },
    /// A stage solve failed; nothing was committed.
    Failed(NonlinearFailure),
}

#[derive(Clone, Debug)]
pub enum Method {
    Bdf(Bdf),
    Dirk(Dirk),
}

impl Method {
    pub fn new(kind: &MethodKind, dimension: usize) -> Self {
        match kind {
            MethodKind::Bdf(cfg) => Method::Bdf(Bdf::new(cfg, dimension)),
            MethodKind::Dirk(cfg) => Method::Dirk(Dirk::new(cfg, dimension)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Bdf(m) => m.name(),
            Method::Dirk(m) => m.name(),
        }
    }

    /// Reset history at `t0`; `dy0` is `f(t0, y0)` or the given `y'(t0)`.
    pub fn initialize(&mut self, t0: f64, y0: &DVector<f64>, dy0: &DVector<f64>, h: f64) {
        match self {
            Method::Bdf(m) => m.initialize(t0, y0, dy0, h),
            Method::Dirk(m) => m.initialize(t0, y0, dy0),
        }
    }

    pub(crate) fn attempt<M: Model>(
        &mut self,
        ctx: &mut StageContext<'_, M>,
        h: f64,
    ) -> SimResult<Attempt> {
        match self {
            Method::Bdf(m) => m.attempt(ctx, h),
            Method::Dirk(m) => m.attempt(ctx, h),
        }
    }

    /// Commit the last successful attempt.
    pub fn accept(&mut self, decision: &StepDecision) {
        match self {
            Method::Bdf(m) => m.accept(decision),
            Method::Dirk(m) => m.accept(),
        }
    }

    /// Time of the committed solution.
    pub fn t(&self) -> f64 {
        match self {
            Method::Bdf(m) => m.t(),
            Method::Dirk(m) => m.t(),
        }
    }

    /// Move the committed time onto `t` (within roundoff of it).
    pub(crate) fn snap_time(&mut self, t: f64) {
        match self {
            Method::Bdf(m) => m.snap_time(t),
            Method::Dirk(m) => m.snap_time(t),
        }
    }

    /// Committed solution at [`Method::t`].
    pub fn current(&self) -> &DVector<f64> {
        match self {
            Method::Bdf(m) => m.current(),
            Method::Dirk(m) => m.current(),
        }
    }

    /// Candidate solution of the last attempt.
    pub fn solution(&self) -> &DVector<f64> {
        match self {
            Method::Bdf(m) => m.solution(),
            Method::Dirk(m) => m.solution(),
        }
    }

    /// Local error estimate of the last attempt.
    pub fn local_error(&self) -> &DVector<f64> {
        match self {
            Method::Bdf(m) => m.local_error(),
            Method::Dirk(m) => m.local_error(),
        }
    }

    /// Dense output over the last accepted step.
    pub fn interpolate(&self, t: f64, out: &mut DVector<f64>) -> SimResult<()> {
        match self {
            Method::Bdf(m) => m.interpolate(t, out),
            Method::Dirk(m) => m.interpolate(t, out),
        }
    }

    /// Order of the next attempt.
    pub fn order(&self) -> usize {
        match self {
            Method::Bdf(m) => m.order(),
            Method::Dirk(m) => m.order(),
        }
    }

    /// Order that sets the controller exponent.
    pub fn error_order(&self) -> usize {
        match self {
            Method::Bdf(m) => m.order(),
            Method::Dirk(m) => m.error_order(),
        }
    }
}

/// Cubic Hermite interpolant through `(t0, y0, f0)` and `(t1, y1, f1)`.
pub(crate) fn hermite(
    (t0, y0, f0): (f64, &DVector<f64>, &DVector<f64>),
    (t1, y1, f1): (f64, &DVector<f64>, &DVector<f64>),
    t: f64,
    out: &mut DVector<f64>,
) {
    let h = t1 - t0;
    let s = (t - t0) / h;
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    for i in 0..out.len() {
        out[i] = h00 * y0[i] + h * h10 * f0[i] + h01 * y1[i] + h * h11 * f1[i];
    }
}
