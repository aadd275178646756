//! Integrator statistics.

use serde::Serialize;

/// Counters and step information; read without side effects.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IntegratorStats {
    /// Accepted internal steps
    pub steps: u64,
    /// Attempted internal steps, including rejected ones
    pub step_attempts: u64,
    /// Problem function evaluations (all purposes)
    pub rhs_evals: u64,
    /// Problem function evaluations spent on difference-quotient Jacobians
    pub rhs_evals_jacobian: u64,
    pub jacobian_evals: u64,
    pub linear_setups: u64,
    pub nonlinear_iterations: u64,
    pub nonlinear_convergence_failures: u64,
    /// Attempts rejected because the stage solve failed
    pub step_convergence_failures: u64,
    pub error_test_failures: u64,
    pub recoverable_failures: u64,
    pub root_evals: u64,
    pub h_initial: f64,
    pub h_last: f64,
    pub h_next: f64,
    pub t_current: f64,
    pub order_last: usize,
    pub order_next: usize,
    pub error_norm_last: f64,
    pub accumulated_error: Option<f64>,
    /// Factor by which tolerances were too small, if ever
    pub tolerance_scale: f64,
}
