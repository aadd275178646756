//! Error types for integration runs.

use sf_core::CoreError;
use sf_solver::SolverError;
use thiserror::Error;

/// Fatal outcomes of an integrator call.
///
/// Variants carrying `t` report the last committed time; the solution at
/// that time stays available on the integrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegratorError {
    #[error("Invalid input: {what}")]
    InvalidInput { what: String },

    #[error("Convergence test failed {failures} times at t = {t}")]
    ConvergenceFailures { t: f64, failures: u32 },

    #[error("Error test failed {failures} times at t = {t}")]
    ErrorTestFailures { t: f64, failures: u32 },

    #[error("Step size {h} fell to the minimum at t = {t}")]
    StepSizeFloor { t: f64, h: f64 },

    #[error("Took {steps} internal steps without reaching tout (t = {t})")]
    TooMuchWork { t: f64, steps: u64 },

    #[error("Tolerances too small at t = {t}; scale them up by at least {factor}")]
    TooMuchAccuracy { t: f64, factor: f64 },

    #[error("Problem function failed at t = {t}: {what}")]
    Evaluation { t: f64, what: String },

    #[error("Root function failed at t = {t}: {what}")]
    RootFunction { t: f64, what: String },

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl IntegratorError {
    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        IntegratorError::InvalidInput { what: what.into() }
    }
}

pub type SimResult<T> = Result<T, IntegratorError>;
