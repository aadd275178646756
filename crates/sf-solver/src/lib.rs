//! Stage-equation solvers for implicit time integration.
//!
//! This crate provides the nonlinear solvers a step method hands its stage
//! equations to (modified Newton with a reused factorization, and fixed-point
//! iteration with optional Anderson acceleration), together with the
//! Jacobian cache, finite-difference Jacobians and dense/banded LU backends
//! they rely on.

pub mod cache;
pub mod convergence;
pub mod error;
pub mod fixed_point;
pub mod jacobian;
pub mod linear;
pub mod newton;
pub mod nonlinear;

pub use cache::{JacobianCache, JacobianReuse, SetupPlan};
pub use convergence::{ConvergenceConfig, ConvergenceInfo, ConvergenceTest, Verdict};
pub use error::{SolverError, SolverResult};
pub use fixed_point::{FixedPointConfig, FixedPointSolver};
pub use jacobian::{Increments, banded_difference_jacobian, finite_difference_jacobian};
pub use linear::{BandedLu, DenseLu, LinearBackend, LinearSolver, LinearSolverKind};
pub use newton::{NewtonConfig, NewtonSolver};
pub use nonlinear::{
    NonlinearBackend, NonlinearFailure, NonlinearOutcome, NonlinearSolver, NonlinearSolverKind,
    NonlinearStats, NonlinearSystem, SetupHint, SolveRequest,
};
